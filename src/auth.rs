use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// A join whose token check takes longer than this is dropped; the identity
///  service hanging must not wedge joins indefinitely.
const JOIN_TOKEN_TIMEOUT: Duration = Duration::from_secs(5);

/// Decides whether a join request carries a token the identity service vouches
///  for. Behind a trait so that the relay core does not depend on HTTP and
///  tests can plug in their own answers.
#[async_trait]
pub trait IdentityVerifier: Send + Sync + 'static {
    async fn verify_join(&self, user_id: &str, token: &str) -> anyhow::Result<bool>;
}

#[derive(Serialize)]
struct JoinTokenRequest<'a> {
    userid: &'a str,
    token: &'a str,
}

/// The service may return more fields; only `valid` matters here.
#[derive(Deserialize)]
struct JoinTokenResponse {
    valid: bool,
}

/// Checks join tokens against the identity service's `auth/join-token`
///  endpoint.
pub struct HttpIdentityVerifier {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpIdentityVerifier {
    pub fn new(base_url: &str) -> anyhow::Result<HttpIdentityVerifier> {
        let endpoint = if base_url.ends_with('/') {
            format!("{}auth/join-token", base_url)
        }
        else {
            format!("{}/auth/join-token", base_url)
        };
        let client = reqwest::Client::builder()
            .timeout(JOIN_TOKEN_TIMEOUT)
            .build()?;
        Ok(HttpIdentityVerifier { client, endpoint })
    }
}

#[async_trait]
impl IdentityVerifier for HttpIdentityVerifier {
    async fn verify_join(&self, user_id: &str, token: &str) -> anyhow::Result<bool> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&JoinTokenRequest { userid: user_id, token })
            .send()
            .await?
            .error_for_status()?;

        let body: JoinTokenResponse = response.json().await?;
        Ok(body.valid)
    }
}
