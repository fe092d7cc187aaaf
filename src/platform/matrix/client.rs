// ABOUTME: Matrix client construction, session restore/login and DM room creation
// ABOUTME: Maps matrix-sdk errors onto the gateway's typed TransportError

use anyhow::{Context, Result};
use fieldbot_core::paths;
use fieldbot_core::session::Credential;
use fieldbot_core::traits::TransportError;
use matrix_sdk::{
    authentication::{matrix::MatrixSession, SessionTokens},
    ruma::{
        api::client::{
            error::ErrorKind,
            room::create_room::v3::{Request as CreateRoomRequest, RoomPreset},
            room::Visibility,
        },
        assign,
        events::{room::encryption::RoomEncryptionEventContent, InitialStateEvent},
        OwnedRoomId, OwnedUserId,
    },
    AuthSession, Client, HttpError, SessionMeta,
};
use serde::{Deserialize, Serialize};

/// Convert a string to a filesystem-safe slug
fn slugify(s: &str) -> String {
    s.trim_start_matches('@')
        .replace(':', "_")
        .chars()
        .filter(|c| c.is_alphanumeric() || *c == '_' || *c == '.' || *c == '-')
        .collect()
}

/// The sqlite state and crypto store is encrypted with `store_passphrase` when one is given
pub async fn create_client(
    homeserver: &str,
    user_id: &str,
    device_name: &str,
    store_passphrase: Option<&str>,
) -> Result<Client> {
    // Include both user and device in path for full isolation
    let crypto_store_path = paths::crypto_store_dir()
        .join(format!("{}_{}", slugify(user_id), slugify(device_name)));

    std::fs::create_dir_all(&crypto_store_path)
        .context("Failed to create crypto store directory")?;

    tracing::debug!(path = %crypto_store_path.display(), "Using crypto store directory");

    let client = Client::builder()
        .homeserver_url(homeserver)
        .sqlite_store(&crypto_store_path, store_passphrase)
        .build()
        .await
        .context("Failed to create Matrix client")?;

    Ok(client)
}

/// The credential blob for a Matrix account, serialized as JSON
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredSession {
    pub user_id: String,
    pub device_id: String,
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
}

impl std::fmt::Debug for StoredSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoredSession")
            .field("user_id", &self.user_id)
            .field("device_id", &self.device_id)
            .field("access_token", &"[REDACTED]")
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

impl StoredSession {
    pub fn from_credential(credential: &Credential) -> Result<Self, TransportError> {
        serde_json::from_slice(credential.as_bytes())
            .map_err(|e| TransportError::CorruptCredential(e.to_string()))
    }

    pub fn to_credential(&self) -> Result<Credential, TransportError> {
        serde_json::to_vec(self)
            .map(Credential::new)
            .map_err(|e| TransportError::CorruptCredential(e.to_string()))
    }
}

/// Restore a previously provisioned session without contacting the login API
pub async fn restore(client: &Client, stored: &StoredSession) -> Result<(), TransportError> {
    let user_id: OwnedUserId = stored
        .user_id
        .parse()
        .map_err(|_| TransportError::CorruptCredential(format!("bad user id {}", stored.user_id)))?;

    let session = AuthSession::Matrix(MatrixSession {
        meta: SessionMeta {
            user_id,
            device_id: stored.device_id.clone().into(),
        },
        tokens: SessionTokens {
            access_token: stored.access_token.clone(),
            refresh_token: stored.refresh_token.clone(),
        },
    });
    client
        .restore_session(session)
        .await
        .map_err(|e| classify_sdk(&e))?;

    tracing::info!(user_id = %stored.user_id, "Matrix session restored");
    Ok(())
}

/// Password login; the resulting tokens become the new credential
pub async fn login_with_password(
    client: &Client,
    user_id: &str,
    password: &str,
    device_name: &str,
) -> Result<StoredSession, TransportError> {
    tracing::info!(user_id, "Provisioning Matrix session with password login");
    let response = client
        .matrix_auth()
        .login_username(user_id, password)
        .initial_device_display_name(device_name)
        .send()
        .await
        .map_err(|e| classify_sdk(&e))?;

    tracing::info!(
        user_id = %response.user_id,
        device_id = %response.device_id,
        "Logged in successfully"
    );

    Ok(StoredSession {
        user_id: response.user_id.to_string(),
        device_id: response.device_id.to_string(),
        access_token: response.access_token,
        refresh_token: response.refresh_token,
    })
}

/// Create an encrypted direct-message room with a user
pub async fn create_dm_room(
    client: &Client,
    user_id: &OwnedUserId,
) -> Result<OwnedRoomId, matrix_sdk::Error> {
    tracing::info!(user_id = %user_id, "Creating DM room");

    let encryption_event = InitialStateEvent::with_empty_state_key(
        RoomEncryptionEventContent::with_recommended_defaults(),
    );

    let request = assign!(CreateRoomRequest::new(), {
        is_direct: true,
        visibility: Visibility::Private,
        preset: Some(RoomPreset::TrustedPrivateChat),
        initial_state: vec![encryption_event.to_raw_any()],
        invite: vec![user_id.clone()],
    });

    let room = client.create_room(request).await?;

    if let Err(e) = room.set_is_direct(true).await {
        tracing::warn!(error = %e, "Failed to mark room as direct");
    }

    let room_id = room.room_id().to_owned();
    tracing::info!(%room_id, user_id = %user_id, "DM room created");
    Ok(room_id)
}

pub fn classify_sdk(err: &matrix_sdk::Error) -> TransportError {
    classify(err.client_api_error_kind(), err.to_string())
}

pub fn classify_http(err: &HttpError) -> TransportError {
    classify(err.client_api_error_kind(), err.to_string())
}

/// Unknown token means the server revoked the session; forbidden or a
/// deactivated account needs an operator; anything else is retried
pub fn classify(kind: Option<&ErrorKind>, detail: String) -> TransportError {
    match kind {
        Some(ErrorKind::UnknownToken { .. }) => TransportError::LoggedOut,
        Some(ErrorKind::Forbidden { .. }) | Some(ErrorKind::UserDeactivated) => {
            TransportError::Auth(detail)
        }
        _ => TransportError::Network(detail),
    }
}

/// Errors from inviting someone who does not exist (or whom the bridge refuses)
pub fn is_unknown_recipient(kind: Option<&ErrorKind>) -> bool {
    matches!(
        kind,
        Some(ErrorKind::NotFound | ErrorKind::InvalidParam | ErrorKind::Forbidden { .. })
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stored() -> StoredSession {
        StoredSession {
            user_id: "@fieldbot:example.org".into(),
            device_id: "FIELDBOT01".into(),
            access_token: "syt_secret".into(),
            refresh_token: None,
        }
    }

    #[test]
    fn test_slugify() {
        assert_eq!(slugify("@fieldbot:example.org"), "fieldbot_example.org");
        assert_eq!(slugify("field bot/1"), "fieldbot1");
    }

    #[test]
    fn test_stored_session_credential_round_trip() {
        let credential = stored().to_credential().unwrap();
        assert_eq!(StoredSession::from_credential(&credential).unwrap(), stored());
    }

    #[test]
    fn test_garbage_credential_is_corrupt() {
        let err = StoredSession::from_credential(&Credential::new(b"not json".to_vec())).unwrap_err();
        assert!(matches!(err, TransportError::CorruptCredential(_)));
    }

    #[test]
    fn test_debug_redacts_tokens() {
        let debug = format!("{:?}", stored());
        assert!(!debug.contains("syt_secret"));
        assert!(debug.contains("[REDACTED]"));
    }

    #[test]
    fn test_classify_error_kinds() {
        assert_eq!(
            classify(Some(&ErrorKind::UnknownToken { soft_logout: false }), "x".into()),
            TransportError::LoggedOut
        );
        assert_eq!(
            classify(Some(&ErrorKind::UserDeactivated), "gone".into()),
            TransportError::Auth("gone".into())
        );
        assert_eq!(
            classify(None, "connection reset".into()),
            TransportError::Network("connection reset".into())
        );
    }

    #[test]
    fn test_unknown_recipient_error_kinds() {
        assert!(is_unknown_recipient(Some(&ErrorKind::NotFound)));
        assert!(is_unknown_recipient(Some(&ErrorKind::InvalidParam)));
        assert!(is_unknown_recipient(Some(&ErrorKind::forbidden())));
        assert!(!is_unknown_recipient(Some(&ErrorKind::UnknownToken { soft_logout: false })));
        assert!(!is_unknown_recipient(Some(&ErrorKind::UserDeactivated)));
        assert!(!is_unknown_recipient(None));
    }
}
