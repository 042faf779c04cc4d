//! Upload helpers: client filename sanitizing and streaming a multipart field to disk.

use axum::extract::multipart::Field;
use axum::http::StatusCode;
use std::path::Path;
use tokio::io::AsyncWriteExt;

/// Reduce a client-supplied filename to a safe basename: ASCII `[A-Za-z0-9_.-]`,
/// whitespace and separators collapsed to `_`, no leading/trailing dots or underscores.
/// May return an empty string.
pub fn secure_filename(name: &str) -> String {
    let spaced: String = name
        .chars()
        .filter(|c| c.is_ascii())
        .map(|c| if c == '/' || c == '\\' { ' ' } else { c })
        .collect();
    let joined = spaced.split_whitespace().collect::<Vec<_>>().join("_");
    let kept: String = joined
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
        .collect();
    kept.trim_matches(|c| c == '.' || c == '_').to_string()
}

/// Lowercased, dot-prefixed extension of `name` (".mp4"), or empty.
pub fn extension_of(name: &str) -> String {
    Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| format!(".{}", e.to_ascii_lowercase()))
        .unwrap_or_default()
}

/// Write `field` to `dest` chunk by chunk. Returns bytes written.
/// On error the partial file is removed and an HTTP status plus message is returned.
pub async fn save_field(mut field: Field<'_>, dest: &Path) -> Result<u64, (StatusCode, String)> {
    let mut file = tokio::fs::File::create(dest).await.map_err(|e| {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Could not store upload: {}", e),
        )
    })?;
    let mut written: u64 = 0;
    let result = loop {
        match field.chunk().await {
            Ok(Some(bytes)) => {
                if let Err(e) = file.write_all(&bytes).await {
                    break Err((
                        StatusCode::INTERNAL_SERVER_ERROR,
                        format!("Could not store upload: {}", e),
                    ));
                }
                written += bytes.len() as u64;
            }
            Ok(None) => break file.flush().await.map(|_| written).map_err(|e| {
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    format!("Could not store upload: {}", e),
                )
            }),
            Err(e) => break Err((e.status(), e.body_text())),
        }
    };
    drop(file);
    if result.is_err() {
        let _ = tokio::fs::remove_file(dest).await;
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secure_filename_strips_paths_and_oddities() {
        assert_eq!(secure_filename("My Talk (final).mp4"), "My_Talk_final.mp4");
        assert_eq!(secure_filename("../../etc/passwd"), "etc_passwd");
        assert_eq!(secure_filename("C:\\Videos\\clip.MOV"), "C_Videos_clip.MOV");
        assert_eq!(secure_filename("  .hidden.mkv"), "hidden.mkv");
        assert_eq!(secure_filename("视频"), "");
    }

    #[test]
    fn extension_is_lowercased() {
        assert_eq!(extension_of("clip.MOV"), ".mov");
        assert_eq!(extension_of("视频.mp4"), ".mp4");
        assert_eq!(extension_of("noext"), "");
    }
}
