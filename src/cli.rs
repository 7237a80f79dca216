use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about = "Media download job service backed by yt-dlp", long_about = None)]
pub struct Args {
    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Configuration file path
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Serve the HTTP API (default)
    Serve {
        /// Address to listen on, overrides the config file
        #[arg(short, long)]
        bind: Option<String>,
    },

    /// Run a single job and print the result
    Run {
        /// Source URL
        url: String,

        /// Job mode (info, audio, best_video, filter, logger, postprocessor, custom_format, download)
        #[arg(short, long, default_value = "info")]
        mode: String,

        /// Job option as key=value, repeatable
        #[arg(short = 'o', long = "option", value_parser = parse_key_value)]
        options: Vec<(String, String)>,
    },
}

fn parse_key_value(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => Ok((key.trim().to_string(), value.to_string())),
        // bare flag
        None if !raw.trim().is_empty() => Ok((raw.trim().to_string(), "true".to_string())),
        _ => Err(format!("expected key=value, got '{}'", raw)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_run_options() {
        let args = Args::parse_from([
            "media-downloader",
            "run",
            "https://example.com/v/1",
            "--mode",
            "audio",
            "-o",
            "codec=mp3",
            "-o",
            "embed_thumbnail",
        ]);

        match args.command {
            Some(Commands::Run { url, mode, options }) => {
                assert_eq!(url, "https://example.com/v/1");
                assert_eq!(mode, "audio");
                assert_eq!(
                    options,
                    vec![
                        ("codec".to_string(), "mp3".to_string()),
                        ("embed_thumbnail".to_string(), "true".to_string())
                    ]
                );
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn serve_is_optional() {
        let args = Args::parse_from(["media-downloader", "--verbose"]);
        assert!(args.verbose);
        assert!(args.command.is_none());
    }

    #[test]
    fn rejects_empty_key() {
        assert!(parse_key_value("=mp3").is_err());
    }
}
