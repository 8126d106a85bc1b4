use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use strata::utils::constants::{DEFAULT_IMAGE_ROOT, DEFAULT_INDEX_URL};
use strata::{PullEvent, PullSession};

/// Strata - Container Image Pull Engine
#[derive(Parser, Debug)]
#[clap(author, version, about = "Pulls registry images into stacked copy-on-write snapshots")]
#[clap(propagate_version = true)]
struct Cli {
    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Pull an image and materialize its layers
    Pull {
        /// Image reference in NAME[:TAG] form
        image: String,

        /// Index server to resolve the image against
        #[clap(long, default_value = DEFAULT_INDEX_URL)]
        index_url: String,

        /// Directory the layers are materialized under
        #[clap(long, default_value = DEFAULT_IMAGE_ROOT)]
        image_root: PathBuf,

        /// Local alias to create once the pull completes
        #[clap(long)]
        local: Option<String>,

        /// Replace an existing local alias
        #[clap(long)]
        force_local: bool,
    },
}

/// Split `name[:tag]`. A colon inside a path segment is only a tag
/// separator when the part after it contains no `/`.
fn split_reference(image: &str) -> (&str, Option<&str>) {
    match image.rsplit_once(':') {
        Some((name, tag)) if !tag.contains('/') => (name, Some(tag)),
        _ => (image, None),
    }
}

fn render_event(event: PullEvent) {
    match event {
        PullEvent::Started { name, tag } => println!("Pulling {}:{}", name, tag),
        PullEvent::RegistrySelected { registry } => println!("Using registry {}", registry),
        PullEvent::TagResolved { id } => println!("Resolved to {}", id),
        PullEvent::AncestryResolved { layers } => println!("Image has {} layers", layers),
        PullEvent::LayerSkipped { id } => println!("Layer {} cached", id),
        PullEvent::LayerPulling { id, index, total } => {
            println!("Layer {} ({}/{})", id, index + 1, total)
        }
        PullEvent::LayerComplete { id } => println!("Layer {} done", id),
        PullEvent::Progress { .. } => {}
        PullEvent::Complete { id } => println!("Pull complete: {}", id),
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Pull {
            image,
            index_url,
            image_root,
            local,
            force_local,
        } => {
            let (name, tag) = split_reference(&image);
            match PullSession::new(&index_url, image_root) {
                Ok(session) => {
                    let mut session = session.with_progress(Box::new(render_event));
                    session
                        .pull(name, tag, local.as_deref(), force_local)
                        .await
                        .map(|_| ())
                }
                Err(e) => Err(e),
            }
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_reference() {
        assert_eq!(split_reference("busybox"), ("busybox", None));
        assert_eq!(split_reference("busybox:1.36"), ("busybox", Some("1.36")));
        assert_eq!(
            split_reference("library/busybox:latest"),
            ("library/busybox", Some("latest"))
        );
        assert_eq!(split_reference("some/odd:path/name"), ("some/odd:path/name", None));
    }
}
