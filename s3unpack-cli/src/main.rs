use clap::{ArgGroup, Parser};
use color_eyre::eyre::WrapErr;
use s3unpack::{ArchiveFormat, ArchiveSinkBuilder};
use std::path::PathBuf;
use tracing::debug;
use url::Url;

mod progress;

/// Unpack a tar or zip archive into S3, one object per file in the archive.
///
/// The archive is read as a stream and never stored on local disk.  Gzip-compressed archives are
/// detected and decompressed automatically.
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
#[clap(group(ArgGroup::new("input").required(true)))]
struct Args {
    /// Read the archive from a file
    #[clap(short = 'f', long, value_parser, group = "input")]
    file: Option<PathBuf>,

    /// Read the archive from stdin
    #[clap(short = 't', long, group = "input")]
    stdin: bool,

    /// The container format of the archive
    #[clap(long, value_enum, default_value_t = ArchiveFormat::Tar)]
    format: ArchiveFormat,

    /// Skip archive entries whose path matches this regular expression.
    ///
    /// Can be given more than once; an entry matching any of the expressions is skipped.  The
    /// expression is matched against the path as it appears in the archive, anywhere in the path
    /// unless anchored with `^` or `$`.
    #[clap(short = 'i', long = "ignore", value_name = "REGEX")]
    ignore: Vec<String>,

    /// The maximum number of objects uploaded at the same time
    #[clap(short = 'j', long, default_value_t = s3unpack::DEFAULT_MAX_PARALLEL)]
    max_parallel: usize,

    /// URL of the S3 bucket (and optional prefix) to which the archive will be unpacked.
    ///
    /// Every file in the archive is written as an S3 object whose key is the prefix and the
    /// file's path in the archive joined with "/".
    ///
    /// For example if the URL is s3://foo/bar and the archive contains a single file a/b/c/d.txt,
    /// the object s3://foo/bar/a/b/c/d.txt is created.  Repeated "/" and "." or ".." path
    /// segments are normalized away.
    #[clap(value_parser, value_name = "URL")]
    target: Url,

    #[clap(flatten)]
    globals: Globals,

    #[clap(flatten)]
    config: s3unpack::Config,
}

/// Arguments that control the CLI's own output
#[derive(Parser, Debug)]
struct Globals {
    /// Enable verbose log output
    #[clap(short = 'v', long, conflicts_with = "quiet", global = true)]
    verbose: bool,

    /// Be quiet, suppress almost all output (except errors)
    #[clap(short = 'q', long, conflicts_with = "verbose", global = true)]
    quiet: bool,
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;

    let args = Args::parse();

    init_logging(&args.globals)?;

    debug!(url = %args.target, format = %args.format, file = ?args.file, "Starting");

    let mut builder = progress::with_spinner(
        &args.globals,
        format!("Checking access to {}", args.target),
        ArchiveSinkBuilder::new(args.config.clone(), args.target.clone()),
    )
    .await
    .wrap_err_with(|| format!("Unable to unpack into {}", args.target))?;

    builder.format(args.format).max_parallel(args.max_parallel);
    for pattern in &args.ignore {
        builder.add_ignore(pattern)?;
    }

    let outcome = match (&args.file, args.stdin) {
        (Some(path), _) => {
            let file = tokio::fs::File::open(path)
                .await
                .wrap_err_with(|| format!("Unable to open archive file {}", path.display()))?;

            progress::run_upload(&args.globals, builder, file).await?
        }
        (None, true) => progress::run_upload(&args.globals, builder, tokio::io::stdin()).await?,
        (None, false) => unreachable!("clap requires one of the input arguments"),
    };

    for key in &outcome.keys {
        debug!(%key, "Uploaded");
    }

    if !args.globals.quiet {
        println!(
            "Unpacked {} objects ({}) from {} archive entries into {}",
            outcome.keys.len(),
            indicatif::BinaryBytes(outcome.total_bytes),
            outcome.total_entries,
            args.target
        );
    }

    Ok(())
}

fn init_logging(globals: &Globals) -> color_eyre::Result<()> {
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::{fmt, EnvFilter};

    let default_filter = if globals.verbose {
        "s3unpack=debug,s3unpack_cli=debug,info"
    } else if globals.quiet {
        "error"
    } else {
        "warn"
    };

    // `RUST_LOG` wins if it's set
    let filter =
        EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(default_filter))?;

    let format = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(globals.verbose);

    tracing_subscriber::registry()
        .with(filter)
        .with(format)
        .try_init()?;

    Ok(())
}
