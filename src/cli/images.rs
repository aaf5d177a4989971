//! The `mcpack images` subcommand.

use std::process::ExitCode;

use clap::Args;
use color_eyre::eyre::WrapErr;

use crate::registry::list_local_images;

#[derive(Args, Debug, Clone, PartialEq, Eq)]
pub struct Images {
    /// Only list images with a tag starting with this prefix
    #[arg(long, value_name = "PREFIX")]
    pub prefix: Option<String>,
}

impl Images {
    /// Print the local image listing, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error when the engine cannot be queried.
    pub fn execute(self) -> color_eyre::Result<ExitCode> {
        let images = list_local_images(self.prefix.as_deref())
            .wrap_err("error listing local images")?;

        if images.is_empty() {
            println!("no images found");
            return Ok(ExitCode::SUCCESS);
        }

        for image in images {
            let tags = if image.tags.is_empty() {
                "<untagged>".to_owned()
            } else {
                image.tags.join(", ")
            };
            println!(
                "{}  {:>10}  {}  {tags}",
                image.id, image.size_formatted, image.created_formatted,
            );
        }

        Ok(ExitCode::SUCCESS)
    }
}
