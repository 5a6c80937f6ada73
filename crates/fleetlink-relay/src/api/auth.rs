//! Identity extraction from gateway-forwarded headers.
//!
//! Token verification and authorization live in the API gateway in
//! front of the relay; by the time a request arrives here the gateway
//! has validated the credentials and forwarded the verified claims as
//! headers. The relay only extracts them and rejects anonymous
//! streams.

use axum::http::HeaderMap;

use super::error::ApiError;

pub const HEADER_TENANT_ID: &str = "x-fleetlink-tenant";
pub const HEADER_DEVICE_ID: &str = "x-fleetlink-device";
pub const HEADER_USER_ID: &str = "x-fleetlink-user";

/// Identity of a device link. The tenant may be empty for
/// single-tenant installations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub tenant_id: String,
    pub device_id: String,
}

impl DeviceIdentity {
    pub fn from_headers(headers: &HeaderMap) -> Result<Self, ApiError> {
        let device_id = header_value(headers, HEADER_DEVICE_ID);
        if device_id.is_empty() {
            return Err(ApiError::Unauthorized);
        }
        Ok(Self {
            tenant_id: header_value(headers, HEADER_TENANT_ID),
            device_id,
        })
    }
}

/// Identity of a management user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserIdentity {
    pub user_id: String,
    pub tenant_id: String,
}

impl UserIdentity {
    pub fn from_headers(headers: &HeaderMap) -> Result<Self, ApiError> {
        let user_id = header_value(headers, HEADER_USER_ID);
        if user_id.is_empty() {
            return Err(ApiError::Unauthorized);
        }
        Ok(Self {
            user_id,
            tenant_id: header_value(headers, HEADER_TENANT_ID),
        })
    }
}

fn header_value(headers: &HeaderMap, name: &str) -> String {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_identity_requires_device_header() {
        let mut headers = HeaderMap::new();
        assert!(matches!(
            DeviceIdentity::from_headers(&headers),
            Err(ApiError::Unauthorized)
        ));

        headers.insert(HEADER_DEVICE_ID, "d1".parse().unwrap());
        let identity = DeviceIdentity::from_headers(&headers).unwrap();
        assert_eq!(identity.device_id, "d1");
        assert_eq!(identity.tenant_id, "");
    }

    #[test]
    fn user_identity_carries_tenant() {
        let mut headers = HeaderMap::new();
        headers.insert(HEADER_USER_ID, "u1".parse().unwrap());
        headers.insert(HEADER_TENANT_ID, "t1".parse().unwrap());

        let identity = UserIdentity::from_headers(&headers).unwrap();
        assert_eq!(identity.user_id, "u1");
        assert_eq!(identity.tenant_id, "t1");
    }

    #[test]
    fn anonymous_user_is_rejected() {
        let headers = HeaderMap::new();
        assert!(matches!(
            UserIdentity::from_headers(&headers),
            Err(ApiError::Unauthorized)
        ));
    }
}
