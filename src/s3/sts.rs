//! STS AssumeRole client
//!
//! Exchanges long-lived credentials for temporary ones. MinIO and AWS both
//! accept the form-encoded `AssumeRole` action signed for the `sts` service.

use super::credentials::Credentials;
use super::signer::{self, Payload, Signer};
use super::transport::{self, HttpRequest, ReqwestTransport, Transport, TransportConfig};
use super::xml::AssumeRoleResult;
use super::S3ClientError;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use reqwest::{Method, Url};
use std::collections::BTreeMap;
use std::sync::Arc;

const STS_SERVICE: &str = "sts";
const STS_VERSION: &str = "2011-06-15";

/// Default session lifetime (1 hour)
pub const DEFAULT_DURATION_SECONDS: u64 = 3600;

/// Temporary credentials plus their expiry
#[derive(Debug, Clone)]
pub struct TemporaryCredentials {
    pub credentials: Credentials,
    pub expiration: Option<DateTime<Utc>>,
}

pub struct StsClient {
    endpoint: String,
    region: String,
    transport: Arc<dyn Transport>,
}

impl StsClient {
    pub fn new(endpoint: impl Into<String>, region: impl Into<String>) -> Result<Self, S3ClientError> {
        let transport = ReqwestTransport::new(&TransportConfig::default())?;
        Ok(Self::with_transport(endpoint, region, Arc::new(transport)))
    }

    pub fn with_transport(
        endpoint: impl Into<String>,
        region: impl Into<String>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            endpoint: endpoint.into(),
            region: region.into(),
            transport,
        }
    }

    /// Assume `role_arn` with `credentials`
    #[tracing::instrument(
        name = "sts.assume_role",
        skip(self, credentials),
        fields(sts.endpoint = %self.endpoint, sts.role_arn = %role_arn),
        err
    )]
    pub async fn assume_role(
        &self,
        credentials: &Credentials,
        role_arn: &str,
        session_name: &str,
        duration_seconds: u64,
    ) -> Result<TemporaryCredentials, S3ClientError> {
        if role_arn.is_empty() {
            return Err(S3ClientError::ConfigError("role_arn is empty".into()));
        }

        let url = Url::parse(&self.endpoint).map_err(|e| {
            S3ClientError::ConfigError(format!("invalid STS endpoint {}: {}", self.endpoint, e))
        })?;

        let form = vec![
            ("Action".to_string(), "AssumeRole".to_string()),
            ("DurationSeconds".to_string(), duration_seconds.to_string()),
            ("RoleArn".to_string(), role_arn.to_string()),
            ("RoleSessionName".to_string(), session_name.to_string()),
            ("Version".to_string(), STS_VERSION.to_string()),
        ];
        let body = signer::build_canonical_query_string(&form);

        let mut headers = BTreeMap::new();
        headers.insert(
            "content-type".to_string(),
            "application/x-www-form-urlencoded; charset=utf-8".to_string(),
        );

        let signed = Signer::new(credentials, &self.region)
            .for_service(STS_SERVICE)
            .sign(
                "POST",
                &url,
                &headers,
                &[],
                Payload::Bytes(body.as_bytes()),
                Utc::now(),
            )?;

        let response = self
            .transport
            .send(HttpRequest {
                method: Method::POST,
                url,
                headers: signed,
                body: Bytes::from(body),
            })
            .await
            .and_then(transport::check_status)?;

        let result = AssumeRoleResult::parse(&response.body_text())?;
        tracing::info!(expiration = ?result.expiration, "AssumeRole completed");

        Ok(TemporaryCredentials {
            credentials: Credentials::temporary(
                result.access_key_id,
                result.secret_access_key,
                result.session_token,
            ),
            expiration: result.expiration,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_assume_role_response() {
        let raw = r#"<AssumeRoleResponse xmlns="https://sts.amazonaws.com/doc/2011-06-15/">
            <AssumeRoleResult>
                <Credentials>
                    <AccessKeyId>ASIATEMP</AccessKeyId>
                    <SecretAccessKey>tempsecret</SecretAccessKey>
                    <SessionToken>tok</SessionToken>
                    <Expiration>2026-01-01T00:00:00Z</Expiration>
                </Credentials>
            </AssumeRoleResult>
        </AssumeRoleResponse>"#;

        let result = AssumeRoleResult::parse(raw).unwrap();
        assert_eq!(result.access_key_id, "ASIATEMP");
        assert_eq!(result.session_token, "tok");
        assert!(result.expiration.is_some());
    }

    #[tokio::test]
    async fn test_empty_role_arn_rejected() {
        let client = StsClient::new("http://localhost:9000", "us-east-1").unwrap();
        let credentials = Credentials::direct("a", "s");
        let result = client.assume_role(&credentials, "", "session", 3600).await;
        assert!(matches!(result, Err(S3ClientError::ConfigError(_))));
    }
}
