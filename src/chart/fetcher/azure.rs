//! Azure workload identity: gets an AAD access token for the pod's managed
//! identity, then exchanges it for an ACR refresh token via ACR's
//! `/oauth2/exchange` endpoint (the management-plane `azure_mgmt_*` crates
//! don't cover this data-plane exchange, so it's a hand-rolled `reqwest`
//! call, the same shape as qovery-engine's direct `reqwest` usage in
//! `cloud_provider/digitalocean/do_api_common.rs`, made async instead of
//! blocking). The resulting refresh token is used as a password under ACR's
//! fixed username convention for token-based logins.

use azure_core::credentials::TokenCredential;
use azure_identity::DefaultAzureCredential;
use serde::Deserialize;

use super::{Credential, FetchError};

const ACR_REFRESH_TOKEN_USERNAME: &str = "00000000-0000-0000-0000-000000000000";
const MANAGEMENT_SCOPE: &str = "https://management.azure.com/.default";

#[derive(Debug, Deserialize)]
struct ExchangeResponse {
    refresh_token: String,
}

pub async fn resolve(http: &reqwest::Client, registry_host: &str) -> Result<Credential, FetchError> {
    let credential = DefaultAzureCredential::new().map_err(|e| FetchError::CredentialExchange(e.to_string()))?;
    let aad_token = credential
        .get_token(&[MANAGEMENT_SCOPE], None)
        .await
        .map_err(|e| FetchError::CredentialExchange(e.to_string()))?;

    let exchange_url = format!("https://{registry_host}/oauth2/exchange");
    let response: ExchangeResponse = http
        .post(&exchange_url)
        .form(&[
            ("grant_type", "access_token"),
            ("service", registry_host),
            ("access_token", aad_token.token.secret()),
        ])
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;

    Ok(Credential::Basic {
        username: ACR_REFRESH_TOKEN_USERNAME.to_string(),
        password: response.refresh_token,
    })
}
