//! イメージプッシュ処理
//!
//! Docker デーモンでビルドしたイメージをレジストリにプッシュする。
//! 進捗は `push` vertex のログとしてトランスクリプトに流す。

use crate::auth::RegistryAuth;
use crate::error::{BuildError, Result};
use crate::progress::{LogEvent, ProgressSender};
use bollard::Docker;
use bollard::models::PushImageInfo;
use futures_util::StreamExt;

pub const PUSH_VERTEX: &str = "push";

pub struct ImagePusher {
    docker: Docker,
    auth: RegistryAuth,
}

impl ImagePusher {
    pub fn new(docker: Docker) -> Self {
        Self {
            docker,
            auth: RegistryAuth::new(),
        }
    }

    /// イメージ参照をレジストリにプッシュする
    ///
    /// タグが無い参照は `latest` としてプッシュする。
    pub async fn push(&self, image_reference: &str, events: &ProgressSender) -> Result<()> {
        let (image, tag) = split_image_tag(image_reference);
        validate_tag(&tag)?;

        let credentials = self.auth.credentials_for(&image).await?;

        #[allow(deprecated)]
        let options = bollard::image::PushImageOptions::<String> { tag: tag.clone() };

        tracing::info!("Pushing {}:{}", image, tag);
        events
            .send(LogEvent::vertex_name(
                PUSH_VERTEX,
                format!("push {}:{}", image, tag),
            ))
            .await;

        #[allow(deprecated)]
        let mut stream = self.docker.push_image(&image, Some(options), credentials);

        let mut last_status = String::new();
        let mut error_message: Option<String> = None;

        while let Some(result) = stream.next().await {
            match result {
                Ok(info) => {
                    if let Some(err) = info.error {
                        events
                            .send(LogEvent::chunk(PUSH_VERTEX, 2, err.as_str()))
                            .await;
                        error_message = Some(err);
                    } else if let Some(line) = progress_line(&info, &mut last_status) {
                        events.send(LogEvent::chunk(PUSH_VERTEX, 1, line)).await;
                    }
                }
                Err(e) => {
                    return Err(BuildError::PushFailed {
                        message: e.to_string(),
                    });
                }
            }
        }

        if let Some(err) = error_message {
            return Err(BuildError::PushFailed { message: err });
        }

        Ok(())
    }
}

/// プッシュ進捗1件をトランスクリプトの1行にする
///
/// 同じステータスの繰り返しとノイズ (Preparing / Waiting) は捨てる。
fn progress_line(info: &PushImageInfo, last_status: &mut String) -> Option<String> {
    let status = info.status.as_ref()?;

    match status.as_str() {
        "Preparing" | "Waiting" | "Pushing" => None,
        "Pushed" | "Layer already exists" => Some(status.clone()),
        _ => {
            if status == last_status {
                return None;
            }
            *last_status = status.clone();
            match info.progress.as_deref() {
                Some(progress) if !progress.is_empty() => {
                    Some(format!("{} {}", status, progress))
                }
                _ => Some(status.clone()),
            }
        }
    }
}

/// Docker タグの制約 (128文字以下、英数字と `.` `-` `_`、先頭は `.` `-` 以外)
fn validate_tag(tag: &str) -> Result<()> {
    if tag.is_empty() {
        return Err(BuildError::InvalidTag {
            tag: "(empty)".to_string(),
        });
    }

    if tag.len() > 128 {
        return Err(BuildError::InvalidTag {
            tag: format!("Tag too long ({} characters, max 128)", tag.len()),
        });
    }

    if tag.starts_with('.') || tag.starts_with('-') {
        return Err(BuildError::InvalidTag {
            tag: tag.to_string(),
        });
    }

    if let Some(c) = tag
        .chars()
        .find(|c| !c.is_ascii_alphanumeric() && *c != '.' && *c != '-' && *c != '_')
    {
        return Err(BuildError::InvalidTag {
            tag: format!("Invalid character '{}' in tag: {}", c, tag),
        });
    }

    Ok(())
}

/// イメージ名とタグを分離
///
/// - `ghcr.io/org/app:v1.0` -> `("ghcr.io/org/app", "v1.0")`
/// - `localhost:5000/app` -> `("localhost:5000/app", "latest")`
pub fn split_image_tag(image: &str) -> (String, String) {
    if let Some(pos) = image.rfind(':') {
        let potential_tag = &image[pos + 1..];
        // `/` を含む場合はレジストリのポート番号
        if !potential_tag.contains('/') {
            return (image[..pos].to_string(), potential_tag.to_string());
        }
    }

    (image.to_string(), "latest".to_string())
}
