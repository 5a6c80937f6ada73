//! Subject naming for the relay's pub/sub traffic.

/// Device-addressed control and data frames.
pub fn device(tenant_id: &str, device_id: &str) -> String {
    format!("device.{tenant_id}.{device_id}")
}

/// Session-scoped frames, either direction.
pub fn session(session_id: &str) -> String {
    format!("session.{session_id}")
}

/// Presence heartbeats.
pub fn presence(tenant_id: &str, device_id: &str) -> String {
    format!("presence.{tenant_id}.{device_id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subject_layout() {
        assert_eq!(device("t1", "d1"), "device.t1.d1");
        assert_eq!(device("", "d1"), "device..d1");
        assert_eq!(session("abc"), "session.abc");
        assert_eq!(presence("t1", "d1"), "presence.t1.d1");
    }
}
