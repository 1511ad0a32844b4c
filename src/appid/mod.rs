use std::net::IpAddr;

/// Application identification for the access log's app column.
///
/// The actual classifier is a separate sidecar daemon; the proxy only
/// consults it through this seam. `None` leaves the column empty.
pub trait AppResolver: Send + Sync {
    fn resolve(&self, src_ip: IpAddr, hostname: &str) -> Option<String>;
}

/// Resolver used when no sidecar is wired up.
pub struct NoopResolver;

impl AppResolver for NoopResolver {
    fn resolve(&self, _src_ip: IpAddr, _hostname: &str) -> Option<String> {
        None
    }
}
