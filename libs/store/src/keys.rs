//! Key layout shared by everything that writes to the coordination store.

/// Root under which every corral key lives.
pub const ROOT: &str = "corral";

/// Key guarding the lock called `name`.
pub fn lock(name: &str) -> String {
    format!("{ROOT}/lock/{name}")
}

/// Directory holding the registrations of `service`.
pub fn service_dir(service: &str) -> String {
    format!("{ROOT}/service/{service}")
}

/// Key of one service registration.
pub fn service(service: &str, host: &str, port: u16) -> String {
    format!("{ROOT}/service/{service}/{host}:{port}")
}
