//! Wires configuration, logging and collaborators to the push orchestration

use crate::cli::args::{Args, Command, ListArgs, PushArgs};
use crate::config::AppConfig;
use crate::error::{AirgapError, Result};
use crate::image::RewrittenImage;
use crate::logging::Logger;
use crate::progress::ProgressOutput;
use crate::push::AirgapPusher;
use crate::registry::{RegistryProcess, SkopeoCopier};
use std::sync::Arc;
use std::time::Duration;

pub struct Runner {
    args: Args,
    config: AppConfig,
    output: Logger,
}

impl Runner {
    pub fn new(args: Args) -> Result<Self> {
        let config = AppConfig::from_env();
        config.validate()?;

        let output = if args.quiet {
            Logger::new_quiet()
        } else {
            Logger::new(args.verbose || config.verbose)
        };

        Ok(Self {
            args,
            config,
            output,
        })
    }

    pub async fn run(&self) -> Result<()> {
        self.output.section("Airgap Image Pusher");
        self.args.validate()?;

        match &self.args.command {
            Command::Push(push) => self.push(push).await,
            Command::List(list) => self.list(list).await,
        }
    }

    fn pusher(&self) -> AirgapPusher {
        let copier = Arc::new(SkopeoCopier::new(&self.config.skopeo_path));
        let temp_registry = Arc::new(RegistryProcess::new(
            &self.config.registry_path,
            Duration::from_secs(self.config.registry_start_timeout),
        ));
        AirgapPusher::new(copier, temp_registry, self.output.clone())
            .with_output(ProgressOutput::stdout())
    }

    async fn push(&self, push: &PushArgs) -> Result<()> {
        let mut options = push.options();
        options.skip_src_tls_verify = self.config.insecure_src_registry;
        if options.skip_src_tls_verify {
            self.output
                .warning("Skipping TLS verification of source registries (development only)");
        }

        let bundle = push.target.bundle();
        let size = std::fs::metadata(bundle)
            .map_err(|e| AirgapError::Io(format!("Cannot read bundle size: {}", e)))?
            .len();
        self.output.info(&format!(
            "Bundle: {} ({})",
            bundle.display(),
            self.output.format_size(size)
        ));
        self.output
            .info(&format!("Target registry: {}", options.registry.endpoint));

        let pusher = self.pusher();
        let images = if push.stream {
            pusher.push_app_images_from_bundle(bundle, &options).await?
        } else {
            pusher.push_images(bundle, &options).await?
        };

        self.output.list(
            "Pushed images",
            &images.iter().map(RewrittenImage::dest_image).collect::<Vec<_>>(),
        );
        self.output.success(&format!(
            "Operation completed successfully in {}",
            self.output.format_duration(self.output.elapsed())
        ));
        Ok(())
    }

    async fn list(&self, list: &ListArgs) -> Result<()> {
        let options = crate::config::PushImagesOptions::new(list.target.registry_options());
        let images = self
            .pusher()
            .list_images_from_bundle(list.target.bundle(), &options)
            .await?;

        let rendered = match list.output.as_str() {
            "json" => serde_json::to_string_pretty(&images)?,
            "yaml" => serde_yaml::to_string(&images)?,
            _ => images
                .iter()
                .map(|image| format!("{} -> {}", image.name, image.dest_image()))
                .collect::<Vec<_>>()
                .join("\n"),
        };
        println!("{}", rendered);
        Ok(())
    }
}
