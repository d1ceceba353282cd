use camino::Utf8Path;
use eyre::{Result as EyreResult, WrapErr};
use sha2::{Digest, Sha256};
use tokio::fs::File;
use tokio::io::AsyncReadExt;

/// SHA-256 over the file contents; the opaque content identifier that
/// travels in push requests.
pub async fn content_id(path: &Utf8Path) -> EyreResult<Vec<u8>> {
    let mut file = File::open(path)
        .await
        .wrap_err_with(|| format!("failed to open {path}"))?;

    let mut hasher = Sha256::new();
    let mut buffer = vec![0_u8; 64 * 1_024];

    loop {
        let read = file.read(&mut buffer).await?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }

    Ok(hasher.finalize().to_vec())
}
