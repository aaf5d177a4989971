//! The `mcpack prune` subcommand.

use std::process::ExitCode;

use clap::Args;
use color_eyre::eyre::WrapErr;

use crate::registry::prune_old_images;

#[derive(Args, Debug, Clone, PartialEq, Eq)]
pub struct Prune {
    /// How many images to keep per repository
    ///
    /// Zero removes every matching image.
    #[arg(short, long, value_name = "COUNT", default_value_t = 3)]
    pub keep: i64,

    /// Only consider images with a tag starting with this prefix
    #[arg(long, value_name = "PREFIX")]
    pub prefix: Option<String>,
}

impl Prune {
    /// Remove images beyond the retention count.
    ///
    /// # Errors
    ///
    /// Returns an error for a negative keep count or when the engine
    /// cannot be queried.
    pub fn execute(self) -> color_eyre::Result<ExitCode> {
        let outcome = prune_old_images(self.keep, self.prefix.as_deref())
            .wrap_err("error pruning images")?;

        for id in &outcome.removed {
            println!("removed {id}");
        }
        println!(
            "kept {} image(s), removed {} image(s), reclaimed {}",
            outcome.kept.len(),
            outcome.removed.len(),
            outcome.space_reclaimed_formatted,
        );

        Ok(ExitCode::SUCCESS)
    }
}
