//! Authentication strategies applied to the dial-time request.
//!
//! A strategy is a tagged variant carrying exactly the fields it needs;
//! the applier is a pure mutation of the outbound request (headers or
//! query string, never the body).

use crate::broker::TokenInfo;
use base64::{engine::general_purpose::STANDARD, Engine};
use http::header::{HeaderName, HeaderValue, AUTHORIZATION};
use thiserror::Error;
use url::Url;

pub const DEFAULT_API_KEY_HEADER: &str = "X-API-Key";

#[derive(Debug, Error)]
pub enum StrategyError {
    #[error("missing credential field: {0}")]
    MissingField(&'static str),
    #[error("failed to apply strategy: {0}")]
    Apply(String),
}

#[derive(Debug, Clone)]
pub enum AuthStrategy {
    BearerToken {
        token: String,
    },
    ApiKeyHeader {
        header_name: String,
        value: String,
    },
    BasicAuth {
        username: String,
        password: String,
    },
    QueryParam {
        name: String,
        value: String,
    },
    AwsSigV4 {
        access_key: String,
        secret_key: String,
        region: String,
        service: String,
    },
}

impl AuthStrategy {
    /// The default mapping of broker-issued tokens.
    pub fn bearer(token: &TokenInfo) -> Self {
        AuthStrategy::BearerToken {
            token: token.access_token.clone(),
        }
    }

    pub fn api_key_header(value: impl Into<String>) -> Self {
        AuthStrategy::ApiKeyHeader {
            header_name: DEFAULT_API_KEY_HEADER.to_string(),
            value: value.into(),
        }
    }

    /// Every variant must carry non-empty credential material before it
    /// is applied to a request.
    pub fn validate(&self) -> Result<(), StrategyError> {
        match self {
            AuthStrategy::BearerToken { token } if token.is_empty() => {
                Err(StrategyError::MissingField("token"))
            }
            AuthStrategy::ApiKeyHeader { header_name, value } => {
                if header_name.is_empty() {
                    Err(StrategyError::MissingField("header_name"))
                } else if value.is_empty() {
                    Err(StrategyError::MissingField("value"))
                } else {
                    Ok(())
                }
            }
            AuthStrategy::BasicAuth { username, .. } if username.is_empty() => {
                Err(StrategyError::MissingField("username"))
            }
            AuthStrategy::QueryParam { name, .. } if name.is_empty() => {
                Err(StrategyError::MissingField("name"))
            }
            AuthStrategy::AwsSigV4 {
                access_key,
                secret_key,
                region,
                service,
            } => {
                if access_key.is_empty() {
                    Err(StrategyError::MissingField("access_key"))
                } else if secret_key.is_empty() {
                    Err(StrategyError::MissingField("secret_key"))
                } else if region.is_empty() {
                    Err(StrategyError::MissingField("region"))
                } else if service.is_empty() {
                    Err(StrategyError::MissingField("service"))
                } else {
                    Ok(())
                }
            }
            _ => Ok(()),
        }
    }

    /// Mutate `request` so it authenticates under this strategy.
    pub fn apply(&self, request: &mut http::Request<()>) -> Result<(), StrategyError> {
        self.validate()?;
        match self {
            AuthStrategy::BearerToken { token } => {
                let value = HeaderValue::from_str(&format!("Bearer {}", token))
                    .map_err(|e| StrategyError::Apply(e.to_string()))?;
                request.headers_mut().insert(AUTHORIZATION, value);
            }
            AuthStrategy::ApiKeyHeader { header_name, value } => {
                let name = HeaderName::from_bytes(header_name.as_bytes())
                    .map_err(|e| StrategyError::Apply(e.to_string()))?;
                let value = HeaderValue::from_str(value)
                    .map_err(|e| StrategyError::Apply(e.to_string()))?;
                request.headers_mut().insert(name, value);
            }
            AuthStrategy::BasicAuth { username, password } => {
                let encoded = STANDARD.encode(format!("{}:{}", username, password));
                let value = HeaderValue::from_str(&format!("Basic {}", encoded))
                    .map_err(|e| StrategyError::Apply(e.to_string()))?;
                request.headers_mut().insert(AUTHORIZATION, value);
            }
            AuthStrategy::QueryParam { name, value } => {
                let mut url = Url::parse(&request.uri().to_string())
                    .map_err(|e| StrategyError::Apply(e.to_string()))?;
                url.query_pairs_mut().append_pair(name, value);
                *request.uri_mut() = url
                    .as_str()
                    .parse()
                    .map_err(|e: http::uri::InvalidUri| StrategyError::Apply(e.to_string()))?;
            }
            AuthStrategy::AwsSigV4 {
                access_key,
                secret_key,
                region,
                service,
            } => {
                sign_sigv4(request, access_key, secret_key, region, service)?;
            }
        }
        Ok(())
    }
}

fn sign_sigv4(
    request: &mut http::Request<()>,
    access_key: &str,
    secret_key: &str,
    region: &str,
    service: &str,
) -> Result<(), StrategyError> {
    use aws_sigv4::http_request::{sign, SignableBody, SignableRequest, SigningSettings};
    use aws_sigv4::sign::v4;

    let identity =
        aws_credential_types::Credentials::new(access_key, secret_key, None, None, "tether-bridge")
            .into();

    let signing_params: aws_sigv4::http_request::SigningParams = v4::SigningParams::builder()
        .identity(&identity)
        .region(region)
        .name(service)
        .time(std::time::SystemTime::now())
        .settings(SigningSettings::default())
        .build()
        .map_err(|e| StrategyError::Apply(e.to_string()))?
        .into();

    // The dial request carries no body; SigV4 signs the empty payload.
    let signable_request = SignableRequest::new(
        request.method().as_str(),
        request.uri().to_string(),
        request.headers().iter().filter_map(|(k, v)| {
            std::str::from_utf8(v.as_bytes())
                .ok()
                .map(|v_str| (k.as_str(), v_str))
        }),
        SignableBody::Bytes(&[]),
    )
    .map_err(|e| StrategyError::Apply(e.to_string()))?;

    let (instructions, _signature) = sign(signable_request, &signing_params)
        .map_err(|e| StrategyError::Apply(e.to_string()))?
        .into_parts();
    instructions.apply_to_request_http1x(request);

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(uri: &str) -> http::Request<()> {
        http::Request::builder()
            .method("GET")
            .uri(uri)
            .header(http::header::HOST, "stream.example.com")
            .body(())
            .unwrap()
    }

    #[test]
    fn bearer_sets_the_authorization_header() {
        let mut req = request("wss://stream.example.com/feed");
        AuthStrategy::BearerToken {
            token: "tok-123".to_string(),
        }
        .apply(&mut req)
        .unwrap();

        assert_eq!(req.headers()[AUTHORIZATION], "Bearer tok-123");
    }

    #[test]
    fn api_key_header_defaults_to_x_api_key() {
        let mut req = request("wss://stream.example.com/feed");
        AuthStrategy::api_key_header("k-1").apply(&mut req).unwrap();
        assert_eq!(req.headers()["x-api-key"], "k-1");

        let mut req = request("wss://stream.example.com/feed");
        AuthStrategy::ApiKeyHeader {
            header_name: "X-Custom-Key".to_string(),
            value: "k-2".to_string(),
        }
        .apply(&mut req)
        .unwrap();
        assert_eq!(req.headers()["x-custom-key"], "k-2");
    }

    #[test]
    fn basic_auth_encodes_user_and_password() {
        let mut req = request("wss://stream.example.com/feed");
        AuthStrategy::BasicAuth {
            username: "agent".to_string(),
            password: "s3cret".to_string(),
        }
        .apply(&mut req)
        .unwrap();

        let expected = format!("Basic {}", STANDARD.encode("agent:s3cret"));
        assert_eq!(req.headers()[AUTHORIZATION], expected.as_str());
    }

    #[test]
    fn query_param_preserves_the_existing_query() {
        let mut req = request("wss://stream.example.com/feed?channel=alpha");
        AuthStrategy::QueryParam {
            name: "api key".to_string(),
            value: "v&1".to_string(),
        }
        .apply(&mut req)
        .unwrap();

        let uri = req.uri().to_string();
        assert!(uri.contains("channel=alpha"));
        // URL-encoded name and value
        assert!(uri.contains("api+key=v%261") || uri.contains("api%20key=v%261"));
    }

    #[test]
    fn sigv4_produces_a_signed_authorization_header() {
        let mut req = request("https://service.us-east-1.amazonaws.com/feed");
        AuthStrategy::AwsSigV4 {
            access_key: "AKIDEXAMPLE".to_string(),
            secret_key: "wJalrXUtnFEMI".to_string(),
            region: "us-east-1".to_string(),
            service: "execute-api".to_string(),
        }
        .apply(&mut req)
        .unwrap();

        let auth = req.headers()[AUTHORIZATION].to_str().unwrap();
        assert!(auth.starts_with("AWS4-HMAC-SHA256"));
        assert!(auth.contains("Credential=AKIDEXAMPLE/"));
        assert!(auth.contains("/us-east-1/execute-api/aws4_request"));
        assert!(req.headers().contains_key("x-amz-date"));
    }

    #[test]
    fn empty_credential_fields_are_rejected() {
        let mut req = request("wss://stream.example.com/feed");

        let err = AuthStrategy::BearerToken {
            token: String::new(),
        }
        .apply(&mut req)
        .unwrap_err();
        assert!(matches!(err, StrategyError::MissingField("token")));

        let err = AuthStrategy::AwsSigV4 {
            access_key: "ak".to_string(),
            secret_key: "sk".to_string(),
            region: String::new(),
            service: "svc".to_string(),
        }
        .apply(&mut req)
        .unwrap_err();
        assert!(matches!(err, StrategyError::MissingField("region")));
    }
}
