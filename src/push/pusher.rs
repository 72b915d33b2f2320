//! Pushes one image with retries, bracketed by progress markers

use super::retry::RetryPolicy;
use crate::error::{AirgapError, Result};
use crate::image::CopySpec;
use crate::logging::Logger;
use crate::progress::{ProgressLine, ProgressSink};
use crate::registry::ImageCopier;
use std::sync::Arc;

#[derive(Clone)]
pub struct ImagePusher {
    copier: Arc<dyn ImageCopier>,
    retry: RetryPolicy,
    logger: Logger,
}

impl ImagePusher {
    pub fn new(copier: Arc<dyn ImageCopier>, retry: RetryPolicy, logger: Logger) -> Self {
        Self {
            copier,
            retry,
            logger,
        }
    }

    /// Copies `spec`, retrying failed attempts.
    ///
    /// Emits `+file.begin` before the first attempt and `+file.end` on
    /// success. When attempts run out the error is emitted as `+file.error`
    /// and returned as [`AirgapError::Copy`].
    pub async fn push(
        &self,
        image_id: &str,
        spec: &CopySpec,
        progress: &ProgressSink,
        log_for_ui: bool,
    ) -> Result<()> {
        progress
            .send(&ProgressLine::ImageBegin(image_id.to_string()))
            .await?;
        if log_for_ui {
            self.logger.info(&format!("Pushing image {}", image_id));
        } else {
            progress
                .send_line(format!("Pushing image {}", spec.dest_ref))
                .await?;
        }

        let max_attempts = self.retry.max_attempts;
        let result = self
            .retry
            .run(
                |attempt| {
                    self.logger.debug(&format!(
                        "Copy attempt {} of {}: {} -> {} (all platforms: {}, authenticated: {})",
                        attempt,
                        max_attempts,
                        spec.src_ref,
                        spec.dest_ref,
                        spec.copy_all,
                        !spec.dest_auth.is_empty()
                    ));
                    self.copier.copy_image(spec, progress)
                },
                |attempt, e| {
                    self.logger.warning(&format!(
                        "Failed to push {} (attempt {} of {}): {}",
                        spec.dest_ref, attempt, max_attempts, e
                    ));
                },
            )
            .await;

        match result {
            Ok(()) => {
                progress
                    .send(&ProgressLine::ImageEnd(image_id.to_string()))
                    .await?;
                self.logger.detail(&format!("Pushed {}", spec.dest_ref));
                Ok(())
            }
            Err(e) => {
                let message = e.to_string();
                progress.send(&ProgressLine::ImageError(message.clone())).await?;
                self.logger.error(&format!(
                    "All {} attempts to push {} failed: {}",
                    max_attempts, spec.dest_ref, message
                ));
                Err(AirgapError::Copy(format!(
                    "failed to push image {}: {}",
                    spec.dest_ref, message
                )))
            }
        }
    }
}
