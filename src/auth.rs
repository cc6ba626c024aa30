use crate::error::AuthError;
use crate::protocol::{AuthMethod, AuthStatus, USERPASS_VERSION};
use std::fmt;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// UserPass holds username/password credentials as dictated
/// server-side
#[derive(Clone, PartialEq, Eq)]
pub struct UserPass {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for UserPass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserPass")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// negotiate_method picks the method for this session from the methods the
/// client offered. With credentials configured only username/password is
/// acceptable; otherwise no-auth is always selected
pub fn negotiate_method(
    offered: &[u8],
    credentials: Option<&UserPass>,
) -> Result<AuthMethod, AuthError> {
    match credentials {
        Some(_) if offered.contains(&(AuthMethod::UserPass as u8)) => Ok(AuthMethod::UserPass),
        Some(_) => Err(AuthError::NoAcceptableMethod),
        None => Ok(AuthMethod::NoAuth),
    }
}

/// perform_password_auth runs the username/password sub-negotiation according
/// to RFC 1929 and writes the status reply. Returns whether the client
/// presented the expected credentials
pub async fn perform_password_auth<S>(stream: &mut S, expected: &UserPass) -> Result<bool, AuthError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // Client Username/Password Request
    // +----+------+----------+------+----------+
    // |VER | ULEN |  UNAME   | PLEN |  PASSWD  |
    // +----+------+----------+------+----------+
    // | 1  |  1   | 1 to 255 |  1   | 1 to 255 |
    // +----+------+----------+------+----------+

    // Sub-negotiation version only has to be present
    let version = stream.read_u8().await?;
    if version != USERPASS_VERSION {
        debug!("unexpected sub-negotiation version {version:#04x}");
    }

    // Read username
    let username_len = stream.read_u8().await?;
    let mut username = vec![0u8; username_len as usize];
    stream.read_exact(&mut username).await?;

    // Read password
    let password_len = stream.read_u8().await?;
    let mut password = vec![0u8; password_len as usize];
    stream.read_exact(&mut password).await?;

    // Validate credentials byte for byte
    let status = if username == expected.username.as_bytes()
        && password == expected.password.as_bytes()
    {
        AuthStatus::Success
    } else {
        AuthStatus::Failure
    };

    // Username/Password Server response
    // +----+--------+
    // |VER | STATUS |
    // +----+--------+
    // | 1  |   1    |
    // +----+--------+
    stream.write_all(&[USERPASS_VERSION, status as u8]).await?;

    match status {
        AuthStatus::Success => Ok(true),
        AuthStatus::Failure => {
            debug!(
                "rejected credentials for user {:?}",
                String::from_utf8_lossy(&username)
            );
            Ok(false)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    fn creds() -> UserPass {
        UserPass {
            username: "admin".to_string(),
            password: "123456".to_string(),
        }
    }

    fn auth_request(user: &[u8], pass: &[u8]) -> Vec<u8> {
        let mut req = vec![USERPASS_VERSION, user.len() as u8];
        req.extend_from_slice(user);
        req.push(pass.len() as u8);
        req.extend_from_slice(pass);
        req
    }

    #[test]
    fn open_policy_always_selects_no_auth() {
        assert_eq!(negotiate_method(&[0x00], None).unwrap(), AuthMethod::NoAuth);
        assert_eq!(negotiate_method(&[0x02], None).unwrap(), AuthMethod::NoAuth);
        assert_eq!(negotiate_method(&[], None).unwrap(), AuthMethod::NoAuth);
    }

    #[test]
    fn password_policy_requires_userpass() {
        let creds = creds();
        assert_eq!(
            negotiate_method(&[0x00, 0x02], Some(&creds)).unwrap(),
            AuthMethod::UserPass
        );
        assert!(matches!(
            negotiate_method(&[0x00], Some(&creds)),
            Err(AuthError::NoAcceptableMethod)
        ));
        assert!(matches!(
            negotiate_method(&[], Some(&creds)),
            Err(AuthError::NoAcceptableMethod)
        ));
    }

    #[tokio::test]
    async fn accepts_matching_credentials() {
        let (mut client, mut server) = duplex(64);
        client
            .write_all(&auth_request(b"admin", b"123456"))
            .await
            .unwrap();

        assert!(perform_password_auth(&mut server, &creds()).await.unwrap());

        let mut reply = [0u8; 2];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [1, 0]);
    }

    #[tokio::test]
    async fn rejects_wrong_password() {
        let (mut client, mut server) = duplex(64);
        client
            .write_all(&auth_request(b"admin", b"654321"))
            .await
            .unwrap();

        assert!(!perform_password_auth(&mut server, &creds()).await.unwrap());

        let mut reply = [0u8; 2];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [1, 1]);
    }

    #[tokio::test]
    async fn tolerates_invalid_utf8_credentials() {
        let (mut client, mut server) = duplex(64);
        client
            .write_all(&auth_request(&[0xFF, 0xFE], &[0xC3]))
            .await
            .unwrap();

        assert!(!perform_password_auth(&mut server, &creds()).await.unwrap());
    }

    #[tokio::test]
    async fn truncated_request_is_io_error() {
        let (mut client, mut server) = duplex(64);
        client.write_all(&[USERPASS_VERSION, 5, b'a']).await.unwrap();
        drop(client);

        let err = perform_password_auth(&mut server, &creds())
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::Io(_)));
    }

    #[test]
    fn debug_redacts_password() {
        let rendered = format!("{:?}", creds());
        assert!(rendered.contains("admin"));
        assert!(!rendered.contains("123456"));
    }
}
