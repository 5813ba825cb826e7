//! GCP workload identity: exchanges the pod's attached service account for
//! an access token, used as an HTTP basic-auth password against Artifact
//! Registry (username is the fixed literal `oauth2accesstoken`, per Google's
//! documented convention for using OAuth tokens with `docker login`-style
//! clients). Grounded on qovery-engine's `services/gcp/auth_service.rs`,
//! which activates a service account for the `gcloud` CLI; here the
//! equivalent token is obtained in-process via `google-cloud-auth` instead
//! of shelling out.

use google_cloud_auth::project::Config;
use google_cloud_auth::token::DefaultTokenSourceProvider;

use super::{Credential, FetchError};

const SCOPE: &str = "https://www.googleapis.com/auth/cloud-platform";

pub async fn resolve() -> Result<Credential, FetchError> {
    let config = Config::default().with_scopes(&[SCOPE]);
    let provider = DefaultTokenSourceProvider::new(config)
        .await
        .map_err(|e| FetchError::CredentialExchange(e.to_string()))?;
    let token = provider
        .token_source()
        .token()
        .await
        .map_err(|e| FetchError::CredentialExchange(e.to_string()))?;
    let bearer = token.strip_prefix("Bearer ").unwrap_or(&token).to_string();

    Ok(Credential::Basic {
        username: "oauth2accesstoken".to_string(),
        password: bearer,
    })
}
