//! SSH transport built on `russh`.

use super::{
    InteractiveShell, RemoteAuth, RemoteCommandRunner, RemoteConnector, RemoteFile, RemoteTarget,
    scp::{self, Ack},
};
use crate::{
    TransportError,
    core::infrastructure::trust_store::{HostKeyVerdict, TrustStore},
};
use async_trait::async_trait;
use russh::{
    Channel, ChannelMsg,
    client::{self, Handle, Msg},
    keys::{PrivateKeyWithHashAlg, PublicKey, load_secret_key},
};
use std::{future::Future, sync::Arc, time::Duration};
use tracing::{debug, warn};

/// Accepts host keys according to the [`TrustStore`].
struct HostKeyCheck {
    address: String,
    port: u16,
    trust: Arc<TrustStore>,
}

impl client::Handler for HostKeyCheck {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        let presented = match server_public_key.to_openssh() {
            Ok(line) => line,
            Err(error) => {
                warn!(%error, address = %self.address, "cannot encode presented host key");
                return Ok(false);
            }
        };
        match self.trust.verify(&self.address, self.port, &presented).await {
            Ok(HostKeyVerdict::Trusted | HostKeyVerdict::Learned) => Ok(true),
            Ok(HostKeyVerdict::Mismatch) => Ok(false),
            Err(error) => {
                warn!(%error, address = %self.address, "trust store unavailable");
                Ok(false)
            }
        }
    }
}

/// Opens SSH sessions to nodes.
pub struct SshConnector {
    config: Arc<client::Config>,
    trust: Arc<TrustStore>,
    connect_timeout: Duration,
    command_timeout: Option<Duration>,
}

impl SshConnector {
    pub fn new(
        trust: Arc<TrustStore>,
        connect_timeout: Duration,
        command_timeout: Option<Duration>,
    ) -> Self {
        let config = client::Config {
            inactivity_timeout: Some(Duration::from_secs(600)),
            ..Default::default()
        };
        Self {
            config: Arc::new(config),
            trust,
            connect_timeout,
            command_timeout,
        }
    }

    async fn establish(&self, target: &RemoteTarget) -> Result<Handle<HostKeyCheck>, TransportError> {
        let address = format!("{}:{}", target.address, target.port);
        let handler = HostKeyCheck {
            address: target.address.clone(),
            port: target.port,
            trust: Arc::clone(&self.trust),
        };
        let connect = client::connect(
            Arc::clone(&self.config),
            (target.address.as_str(), target.port),
            handler,
        );
        match tokio::time::timeout(self.connect_timeout, connect).await {
            Ok(Ok(handle)) => Ok(handle),
            Ok(Err(error)) => Err(TransportError::Dial {
                address,
                message: error.to_string(),
            }),
            Err(_) => Err(TransportError::Dial {
                address,
                message: format!("no answer within {:?}", self.connect_timeout),
            }),
        }
    }

    async fn authenticate(
        handle: &mut Handle<HostKeyCheck>,
        target: &RemoteTarget,
        auth: &RemoteAuth,
    ) -> Result<(), TransportError> {
        let result = match auth {
            RemoteAuth::PrivateKey(path) => {
                let key = load_secret_key(path, None)
                    .map_err(|e| TransportError::Key(format!("{}: {e}", path.display())))?;
                let hash = handle
                    .best_supported_rsa_hash()
                    .await
                    .map_err(channel_error)?
                    .flatten();
                handle
                    .authenticate_publickey(
                        target.user.as_str(),
                        PrivateKeyWithHashAlg::new(Arc::new(key), hash),
                    )
                    .await
            }
            RemoteAuth::Password(password) => {
                handle
                    .authenticate_password(target.user.as_str(), password.as_str())
                    .await
            }
        }
        .map_err(channel_error)?;

        if result.success() {
            Ok(())
        } else {
            Err(TransportError::AuthenticationRejected {
                user: target.user.clone(),
                address: target.address.clone(),
            })
        }
    }
}

#[async_trait]
impl RemoteConnector for SshConnector {
    async fn connect(
        &self,
        target: &RemoteTarget,
        auth: &RemoteAuth,
    ) -> Result<Box<dyn RemoteCommandRunner>, TransportError> {
        let mut handle = self.establish(target).await?;
        Self::authenticate(&mut handle, target, auth).await?;
        debug!(address = %target.address, user = %target.user, "ssh session open");
        Ok(Box::new(SshRunner {
            handle,
            address: target.address.clone(),
            command_timeout: self.command_timeout,
        }))
    }

    async fn open_shell(
        &self,
        target: &RemoteTarget,
        password: &str,
    ) -> Result<Box<dyn InteractiveShell>, TransportError> {
        let mut handle = self.establish(target).await?;
        Self::authenticate(&mut handle, target, &RemoteAuth::Password(password.to_string()))
            .await?;
        let channel = handle
            .channel_open_session()
            .await
            .map_err(channel_error)?;
        channel
            .request_pty(true, "xterm", 120, 40, 0, 0, &[])
            .await
            .map_err(channel_error)?;
        channel.request_shell(true).await.map_err(channel_error)?;
        Ok(Box::new(SshShell {
            _handle: handle,
            channel,
        }))
    }
}

#[derive(Default)]
struct ExecOutput {
    stdout: Vec<u8>,
    combined: Vec<u8>,
    status: Option<u32>,
}

/// Runs commands over one authenticated SSH session.
pub struct SshRunner {
    handle: Handle<HostKeyCheck>,
    address: String,
    command_timeout: Option<Duration>,
}

/// Runs `work`, abandoning it as [`TransportError::Timeout`] after `limit`.
async fn bounded<T>(
    limit: Option<Duration>,
    command: &str,
    work: impl Future<Output = Result<T, TransportError>>,
) -> Result<T, TransportError> {
    match limit {
        Some(limit) => tokio::time::timeout(limit, work).await.map_err(|_| {
            TransportError::Timeout {
                command: command.to_string(),
                timeout: limit,
            }
        })?,
        None => work.await,
    }
}

impl SshRunner {

    async fn exec(&self, command: &str) -> Result<ExecOutput, TransportError> {
        let mut channel = self
            .handle
            .channel_open_session()
            .await
            .map_err(channel_error)?;
        channel.exec(true, command).await.map_err(channel_error)?;

        let mut output = ExecOutput::default();
        while let Some(message) = channel.wait().await {
            match message {
                ChannelMsg::Data { ref data } => {
                    output.stdout.extend_from_slice(data);
                    output.combined.extend_from_slice(data);
                }
                ChannelMsg::ExtendedData { ref data, .. } => {
                    output.combined.extend_from_slice(data);
                }
                ChannelMsg::ExitStatus { exit_status } => output.status = Some(exit_status),
                _ => {}
            }
        }
        Ok(output)
    }

    async fn checked(&self, command: &str) -> Result<ExecOutput, TransportError> {
        debug!(address = %self.address, %command, "remote command");
        let output = bounded(self.command_timeout, command, self.exec(command)).await?;
        match output.status {
            Some(0) => Ok(output),
            Some(status) => Err(TransportError::ExitStatus {
                command: command.to_string(),
                status,
                output: String::from_utf8_lossy(&output.combined).into_owned(),
            }),
            None => Err(TransportError::Channel(format!(
                "`{command}` ended without an exit status"
            ))),
        }
    }

    async fn send_file(&self, file: &RemoteFile) -> Result<(), TransportError> {
        let path = file.target_path();
        let copy_error = |message: String| TransportError::Copy {
            path: path.clone(),
            message,
        };

        let mut channel = self
            .handle
            .channel_open_session()
            .await
            .map_err(channel_error)?;
        channel
            .exec(true, scp::sink_command(file))
            .await
            .map_err(channel_error)?;

        let mut pending = Vec::new();
        expect_ack(&mut channel, &mut pending)
            .await
            .map_err(copy_error)?;
        channel
            .data(scp::file_header(file).as_bytes())
            .await
            .map_err(channel_error)?;
        expect_ack(&mut channel, &mut pending)
            .await
            .map_err(copy_error)?;
        channel
            .data(&file.content[..])
            .await
            .map_err(channel_error)?;
        channel.data(&[0u8][..]).await.map_err(channel_error)?;
        expect_ack(&mut channel, &mut pending)
            .await
            .map_err(copy_error)?;
        channel.eof().await.map_err(channel_error)?;

        while let Some(message) = channel.wait().await {
            if let ChannelMsg::ExitStatus { exit_status } = message {
                if exit_status != 0 {
                    return Err(copy_error(format!("scp exited with status {exit_status}")));
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteCommandRunner for SshRunner {
    async fn run(&self, command: &str) -> Result<String, TransportError> {
        let output = self.checked(command).await?;
        Ok(String::from_utf8_lossy(&output.combined).into_owned())
    }

    async fn copy(&self, file: &RemoteFile) -> Result<(), TransportError> {
        self.checked(&scp::prepare_command(file)).await?;
        debug!(
            address = %self.address,
            path = %file.target_path(),
            bytes = file.content.len(),
            "copying file"
        );
        bounded(
            self.command_timeout,
            &scp::sink_command(file),
            self.send_file(file),
        )
        .await
    }

    async fn fetch(&self, remote_path: &str) -> Result<Vec<u8>, TransportError> {
        let output = self.checked(&format!("cat {remote_path}")).await?;
        Ok(output.stdout)
    }
}

/// Reads the next acknowledgement of the SCP sink.
async fn expect_ack(channel: &mut Channel<Msg>, pending: &mut Vec<u8>) -> Result<(), String> {
    loop {
        match scp::parse_ack(pending) {
            Ack::Ok { consumed } => {
                pending.drain(..consumed);
                return Ok(());
            }
            Ack::Error {
                fatal,
                message,
                consumed,
            } => {
                pending.drain(..consumed);
                let severity = if fatal { "error" } else { "warning" };
                return Err(format!("sink reported {severity}: {message}"));
            }
            Ack::Incomplete => match channel.wait().await {
                Some(ChannelMsg::Data { ref data }) => pending.extend_from_slice(data),
                Some(ChannelMsg::ExitStatus { exit_status }) => {
                    return Err(format!("scp exited with status {exit_status}"));
                }
                Some(ChannelMsg::Eof | ChannelMsg::Close) | None => {
                    return Err("scp closed the channel".to_string());
                }
                Some(_) => {}
            },
        }
    }
}

struct SshShell {
    _handle: Handle<HostKeyCheck>,
    channel: Channel<Msg>,
}

#[async_trait]
impl InteractiveShell for SshShell {
    async fn send(&mut self, input: &[u8]) -> Result<(), TransportError> {
        self.channel.data(input).await.map_err(channel_error)
    }

    async fn recv(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
        loop {
            match self.channel.wait().await {
                Some(ChannelMsg::Data { ref data }) | Some(ChannelMsg::ExtendedData { ref data, .. }) => {
                    return Ok(Some(data.to_vec()));
                }
                Some(ChannelMsg::Eof | ChannelMsg::Close) | None => return Ok(None),
                Some(_) => {}
            }
        }
    }
}

fn channel_error(error: russh::Error) -> TransportError {
    TransportError::Channel(error.to_string())
}
