//! SSH local port forwarding.
//!
//! A tunnel listens on an ephemeral `127.0.0.1` port and forwards every
//! accepted socket through a `direct-tcpip` channel to the database host as
//! seen from the jump host. All failures here are tunnel-class errors, kept
//! apart from database authentication failures.

use async_trait::async_trait;
use russh::client;
use russh::Disconnect;
use russh_keys::agent::client::AgentClient;
use russh_keys::key::KeyPair;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::error::{QuarryError, QuarryResult};
use crate::models::{SshAuthMethod, SshTunnelConfig};
use crate::services::adapter::TunnelHandle;

type Session = Arc<Mutex<client::Handle<HostKeyPolicy>>>;

/// Accepts every server key.
///
/// Jump hosts are trusted on first and every use: the catalog stores no host
/// key fingerprints and `~/.ssh/known_hosts` is not consulted.
struct HostKeyPolicy;

#[async_trait]
impl client::Handler for HostKeyPolicy {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &russh_keys::key::PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

/// An open forward. Dropping it stops accepting new sockets.
pub struct SshTunnel {
    local_port: u16,
    remote: String,
    session: Session,
    cancel: CancellationToken,
    closed: AtomicBool,
}

impl SshTunnel {
    /// Dial the jump host, authenticate, and start forwarding to
    /// `remote_host:remote_port`.
    pub async fn open(
        ssh: &SshTunnelConfig,
        remote_host: &str,
        remote_port: u16,
    ) -> QuarryResult<Self> {
        tracing::info!(
            ssh_host = %ssh.host,
            ssh_port = ssh.port,
            remote_host,
            remote_port,
            "Opening SSH tunnel"
        );

        let handle = connect_and_authenticate(ssh).await?;
        let session: Session = Arc::new(Mutex::new(handle));

        let listener = TcpListener::bind("127.0.0.1:0").await.map_err(|e| {
            QuarryError::tunnel_with_hint(
                format!("Failed to bind local port for SSH tunnel: {e}"),
                "Check that loopback networking is available",
            )
        })?;
        let local_port = listener.local_addr()?.port();

        let cancel = CancellationToken::new();
        tokio::spawn(accept_loop(
            listener,
            Arc::clone(&session),
            remote_host.to_string(),
            remote_port,
            cancel.clone(),
        ));

        tracing::info!(local_port, remote_host, remote_port, "SSH tunnel listening");

        Ok(Self {
            local_port,
            remote: format!("{remote_host}:{remote_port}"),
            session,
            cancel,
            closed: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl TunnelHandle for SshTunnel {
    fn local_port(&self) -> u16 {
        self.local_port
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancel.cancel();
        let session = self.session.lock().await;
        if let Err(e) = session.disconnect(Disconnect::ByApplication, "", "en").await {
            tracing::debug!(error = %e, "SSH disconnect reported an error");
        }
        tracing::info!(local_port = self.local_port, remote = %self.remote, "SSH tunnel closed");
    }
}

impl Drop for SshTunnel {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn connect_and_authenticate(
    ssh: &SshTunnelConfig,
) -> QuarryResult<client::Handle<HostKeyPolicy>> {
    let config = Arc::new(client::Config::default());
    let mut handle = client::connect(config, (ssh.host.as_str(), ssh.port), HostKeyPolicy)
        .await
        .map_err(|e| {
            QuarryError::tunnel_with_hint(
                format!("Failed to connect to SSH server {}:{}: {e}", ssh.host, ssh.port),
                "Verify the SSH server is running and reachable",
            )
        })?;

    let authenticated = match ssh.auth_method {
        SshAuthMethod::Key => {
            let key_path = ssh.expanded_key_path().ok_or_else(|| {
                QuarryError::tunnel("Key path is required for key-based SSH authentication")
            })?;
            let passphrase = ssh.key_passphrase.as_deref();
            let key_ok =
                authenticate_key_file(&mut handle, &ssh.username, &key_path, passphrase).await;
            match (key_ok, ssh.password.as_deref().filter(|p| !p.is_empty())) {
                (Ok(true), _) => true,
                (Ok(false) | Err(_), Some(password)) => {
                    tracing::debug!("SSH key rejected, falling back to password");
                    authenticate_password(&mut handle, &ssh.username, password).await?
                }
                (Ok(false), None) => false,
                (Err(e), None) => return Err(e),
            }
        }
        SshAuthMethod::Password => {
            let password = ssh.password.as_deref().unwrap_or_default();
            authenticate_password(&mut handle, &ssh.username, password).await?
        }
        SshAuthMethod::Agent => authenticate_with_agent(&mut handle, &ssh.username).await?,
    };

    if !authenticated {
        return Err(QuarryError::tunnel_with_hint(
            format!("SSH authentication failed for {}@{}", ssh.username, ssh.host),
            "Check the SSH username and credentials",
        ));
    }

    tracing::info!(user = %ssh.username, host = %ssh.host, "SSH authentication successful");
    Ok(handle)
}

async fn authenticate_password(
    handle: &mut client::Handle<HostKeyPolicy>,
    username: &str,
    password: &str,
) -> QuarryResult<bool> {
    handle.authenticate_password(username, password).await.map_err(|e| {
        QuarryError::tunnel_with_hint(
            format!("SSH password authentication failed: {e}"),
            "Check your SSH username and password",
        )
    })
}

async fn authenticate_key_file(
    handle: &mut client::Handle<HostKeyPolicy>,
    username: &str,
    path: &Path,
    passphrase: Option<&str>,
) -> QuarryResult<bool> {
    let key = load_private_key(path, passphrase).await?;
    handle.authenticate_publickey(username, key).await.map_err(|e| {
        QuarryError::tunnel_with_hint(
            format!("SSH key authentication failed: {e}"),
            "Verify your SSH key is valid and has the correct permissions",
        )
    })
}

async fn load_private_key(path: &Path, passphrase: Option<&str>) -> QuarryResult<Arc<KeyPair>> {
    let key_data = tokio::fs::read_to_string(path).await.map_err(|e| {
        QuarryError::tunnel_with_hint(
            format!("Failed to read SSH key file {}: {e}", path.display()),
            "Check that the key file exists and is readable",
        )
    })?;

    let key =
        russh_keys::decode_secret_key(&key_data, passphrase.filter(|p| !p.is_empty())).map_err(|e| {
            let hint = if passphrase.is_some() {
                "Check your key passphrase is correct"
            } else {
                "The key may be encrypted - provide the passphrase"
            };
            QuarryError::tunnel_with_hint(format!("Failed to load SSH key: {e}"), hint)
        })?;

    Ok(Arc::new(key))
}

#[cfg(unix)]
async fn authenticate_with_agent(
    handle: &mut client::Handle<HostKeyPolicy>,
    username: &str,
) -> QuarryResult<bool> {
    use tokio::net::UnixStream;

    let socket_path = std::env::var("SSH_AUTH_SOCK").map_err(|_| {
        QuarryError::tunnel_with_hint(
            "SSH agent not available (SSH_AUTH_SOCK not set)",
            "Start your SSH agent with: eval $(ssh-agent)",
        )
    })?;
    let stream = UnixStream::connect(&socket_path).await.map_err(|e| {
        QuarryError::tunnel_with_hint(
            format!("Failed to connect to SSH agent: {e}"),
            "Ensure your SSH agent is running",
        )
    })?;

    try_agent_identities(handle, username, AgentClient::connect(stream)).await
}

#[cfg(windows)]
async fn authenticate_with_agent(
    handle: &mut client::Handle<HostKeyPolicy>,
    username: &str,
) -> QuarryResult<bool> {
    use tokio::net::windows::named_pipe::ClientOptions;

    let pipe = ClientOptions::new().open(r"\\.\pipe\openssh-ssh-agent").map_err(|e| {
        QuarryError::tunnel_with_hint(
            format!("Failed to connect to SSH agent: {e}"),
            "Ensure the OpenSSH Authentication Agent service is running",
        )
    })?;

    try_agent_identities(handle, username, AgentClient::connect(pipe)).await
}

async fn try_agent_identities<S>(
    handle: &mut client::Handle<HostKeyPolicy>,
    username: &str,
    mut agent: AgentClient<S>,
) -> QuarryResult<bool>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + Unpin + 'static,
{
    let identities = agent.request_identities().await.map_err(|e| {
        QuarryError::tunnel_with_hint(
            format!("Failed to get identities from SSH agent: {e}"),
            "Ensure your SSH agent is running and has keys loaded",
        )
    })?;

    if identities.is_empty() {
        return Err(QuarryError::tunnel_with_hint(
            "No identities available in SSH agent",
            "Add your SSH key to the agent with: ssh-add",
        ));
    }

    for identity in identities {
        let (returned, result) = handle.authenticate_future(username, identity, agent).await;
        agent = returned;
        match result {
            Ok(true) => return Ok(true),
            Ok(false) => tracing::debug!("SSH agent identity rejected"),
            Err(e) => tracing::debug!(error = %e, "SSH agent identity failed"),
        }
    }
    Ok(false)
}

async fn accept_loop(
    listener: TcpListener,
    session: Session,
    remote_host: String,
    remote_port: u16,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    tracing::trace!(%peer, "Tunnel socket accepted");
                    let session = Arc::clone(&session);
                    let remote_host = remote_host.clone();
                    let cancel = cancel.clone();
                    tokio::spawn(async move {
                        let forwarded =
                            forward(stream, session, &remote_host, remote_port, cancel).await;
                        if let Err(e) = forwarded {
                            tracing::warn!(error = %e, "Tunnel forwarding error");
                        }
                    });
                }
                Err(e) => tracing::error!(error = %e, "Failed to accept tunnel connection"),
            },
            _ = cancel.cancelled() => break,
        }
    }
}

async fn forward(
    mut local: TcpStream,
    session: Session,
    remote_host: &str,
    remote_port: u16,
    cancel: CancellationToken,
) -> QuarryResult<()> {
    let channel = {
        let handle = session.lock().await;
        handle
            .channel_open_direct_tcpip(remote_host, u32::from(remote_port), "127.0.0.1", 0)
            .await
            .map_err(|e| {
                QuarryError::tunnel_with_hint(
                    format!("Failed to open SSH channel: {e}"),
                    "The SSH server may not allow TCP forwarding",
                )
            })?
    };

    let mut remote = channel.into_stream();
    let mut up = [0u8; 8192];
    let mut down = [0u8; 8192];

    loop {
        tokio::select! {
            n = local.read(&mut up) => match n {
                Ok(0) | Err(_) => break,
                Ok(n) => if remote.write_all(&up[..n]).await.is_err() { break },
            },
            n = remote.read(&mut down) => match n {
                Ok(0) | Err(_) => break,
                Ok(n) => if local.write_all(&down[..n]).await.is_err() { break },
            },
            _ = cancel.cancelled() => break,
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use russh::client::Handler;

    const ED25519_KEY: &str =
        concat!("AAAAC3NzaC1lZDI1NTE5AAAAIFhmZmZmZmZmZmZm", "ZmZmZmZmZmZmZmZmZmZmZmZmZmZm");

    #[tokio::test]
    async fn test_host_keys_are_trusted() {
        let key = russh_keys::parse_public_key_base64(ED25519_KEY).unwrap();
        let mut policy = HostKeyPolicy;
        assert!(policy.check_server_key(&key).await.unwrap());
    }
}
