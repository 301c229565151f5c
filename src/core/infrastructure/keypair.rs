//! The SSH keypair authorized on every node.

use crate::{
    PveKubeError, PveKubeResult, StateLayout,
    core::infrastructure::atomic_file::{write_atomic, write_private},
};
use russh::keys::{
    Algorithm, PrivateKey,
    ssh_key::{LineEnding, rand_core::OsRng},
};
use tracing::info;

const KEY_COMMENT: &str = "pvekube";

/// Generates `id_rsa`/`id_rsa.pub` under the state directory unless both exist.
///
/// The key type is ed25519; the file names are kept for compatibility with
/// existing state directories. The private half is never readable by others.
pub async fn ensure_keypair(layout: &StateLayout) -> PveKubeResult<()> {
    let private = layout.private_key_path();
    let public = layout.public_key_path();
    let have_private = tokio::fs::try_exists(&private).await.unwrap_or(false);
    let have_public = tokio::fs::try_exists(&public).await.unwrap_or(false);
    if have_private && have_public {
        return Ok(());
    }
    if have_private != have_public {
        return Err(PveKubeError::Precondition(format!(
            "only half of the keypair exists in {}; remove it or restore the other half",
            layout.state_dir().display()
        )));
    }

    let (private_pem, public_line) = generate()?;
    write_private(&private, private_pem.as_bytes()).await?;
    write_atomic(&public, public_line.as_bytes()).await?;
    info!(path = %private.display(), "generated node access keypair");
    Ok(())
}

/// OpenSSH encodings of a fresh ed25519 keypair: the private PEM and the
/// `authorized_keys` line.
fn generate() -> PveKubeResult<(String, String)> {
    let failed = |e: russh::keys::ssh_key::Error| {
        PveKubeError::Precondition(format!("cannot generate the node access key: {e}"))
    };
    let mut key = PrivateKey::random(&mut OsRng, Algorithm::Ed25519).map_err(failed)?;
    key.set_comment(KEY_COMMENT);
    let private_pem = key.to_openssh(LineEnding::LF).map_err(failed)?;
    let public_line = key.public_key().to_openssh().map_err(failed)?;
    Ok((private_pem.as_str().to_owned(), format!("{public_line}\n")))
}

/// Public key line to install in `authorized_keys`.
pub async fn public_key(layout: &StateLayout) -> PveKubeResult<String> {
    let raw = tokio::fs::read_to_string(layout.public_key_path()).await?;
    let line = raw.trim();
    if line.is_empty() || line.contains('\'') {
        return Err(PveKubeError::Data(
            "public key file is empty or malformed".to_string(),
        ));
    }
    Ok(line.to_string())
}
