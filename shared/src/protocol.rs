/// Service-location prefix clients look up before connecting, e.g.
/// "_minecraft._tcp.survival.mc.example.com."
pub const GAME_SERVICE_PREFIX: &str = "_minecraft._tcp";

/// Fixed priority and weight on every synthesized service-location answer
pub const SRV_PRIORITY: u16 = 10;
pub const SRV_WEIGHT: u16 = 10;

/// Default label under the root domain that resolves to the dispatcher itself
pub const DEFAULT_DISPATCH_LABEL: &str = "dispatch";

/// API path prefix
pub const API_PREFIX: &str = "/v1";

/// Service-location record key for an endpoint subdomain
pub fn service_record_name(sub_domain: &str) -> String {
    format!("{}.{}", GAME_SERVICE_PREFIX, sub_domain)
}
