//! AWS workload identity: exchanges the pod's assumed-role credentials for
//! an ECR authorization token. Grounded on qovery-engine's
//! `ECR::get_credentials` (`container_registry/ecr.rs`), which decodes the
//! base64 `username:password` token the same way; that code calls the
//! blocking `rusoto` client via `block_on_with_timeout`, here the async
//! `aws-sdk-ecr`/`aws-sdk-sts` clients are awaited directly. The STS call
//! mirrors qovery-engine's own pattern of confirming the assumed role via
//! `sts.get_caller_identity` before trusting it for a registry exchange
//! (spec §4.6: "call STS via the container-credential endpoint, then call
//! ECR GetAuthorizationToken").

use base64::Engine;

use super::{Credential, FetchError};

pub async fn resolve(registry_host: &str) -> Result<Credential, FetchError> {
    let region = region_from_host(registry_host);
    let shared_config = aws_config::defaults(aws_config::BehaviorVersion::latest())
        .region(aws_types::region::Region::new(region.to_string()))
        .load()
        .await;

    aws_sdk_sts::Client::new(&shared_config)
        .get_caller_identity()
        .send()
        .await
        .map_err(|e| FetchError::CredentialExchange(format!("STS identity check failed: {e}")))?;

    let client = aws_sdk_ecr::Client::new(&shared_config);

    let output = client
        .get_authorization_token()
        .send()
        .await
        .map_err(|e| FetchError::CredentialExchange(e.to_string()))?;

    let token = output
        .authorization_data
        .unwrap_or_default()
        .into_iter()
        .next()
        .and_then(|ad| ad.authorization_token)
        .ok_or_else(|| FetchError::CredentialExchange("ECR returned no authorization data".to_string()))?;

    let decoded = base64::engine::general_purpose::STANDARD
        .decode(&token)
        .map_err(|e| FetchError::CredentialExchange(format!("malformed ECR token: {e}")))?;
    let decoded = String::from_utf8(decoded)
        .map_err(|e| FetchError::CredentialExchange(format!("non-utf8 ECR token: {e}")))?;
    let (username, password) = decoded
        .split_once(':')
        .ok_or_else(|| FetchError::CredentialExchange("ECR token missing `:` separator".to_string()))?;

    Ok(Credential::Basic {
        username: username.to_string(),
        password: password.to_string(),
    })
}

/// ECR hostnames are `<account>.dkr.ecr.<region>.amazonaws.com`.
fn region_from_host(host: &str) -> &str {
    host.split('.').nth(3).unwrap_or("us-east-1")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_region_out_of_ecr_hostname() {
        assert_eq!(region_from_host("123456789012.dkr.ecr.eu-west-3.amazonaws.com"), "eu-west-3");
    }
}
