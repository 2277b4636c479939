use clap::{
    Arg, ArgAction, ColorChoice, Command,
    builder::ValueParser,
    builder::styling::{AnsiColor, Effects, Styles},
};
use std::{fs, path::PathBuf};

pub fn validator_is_file() -> ValueParser {
    ValueParser::from(move |s: &str| -> std::result::Result<PathBuf, String> {
        if let Ok(metadata) = fs::metadata(s) {
            if metadata.is_file() {
                return Ok(PathBuf::from(s));
            }
        }

        Err(format!("Invalid file path or file does not exist: '{s}'"))
    })
}

pub fn validator_is_dir() -> ValueParser {
    ValueParser::from(move |s: &str| -> std::result::Result<PathBuf, String> {
        if let Ok(metadata) = fs::metadata(s) {
            if metadata.is_dir() {
                return Ok(PathBuf::from(s));
            }
        }

        Err(format!("Invalid path or directory does not exist: '{s}'"))
    })
}

/// Expand any `--extra-args a,b,c` occurrences into individual argv tokens
/// before clap sees them. Tokens without a leading `-` naturally become the
/// value of the preceding option, courtesy of clap's parsing.
#[must_use]
pub fn expand_extra_args<I>(args: I) -> Vec<String>
where
    I: IntoIterator<Item = String>,
{
    let mut out = Vec::new();
    let mut iter = args.into_iter();

    while let Some(arg) = iter.next() {
        if arg == "--extra-args" {
            if let Some(extra) = iter.next() {
                out.extend(split_extra(&extra));
            }
        } else if let Some(extra) = arg.strip_prefix("--extra-args=") {
            out.extend(split_extra(extra));
        } else {
            out.push(arg);
        }
    }

    out
}

fn split_extra(value: &str) -> Vec<String> {
    value
        .split(',')
        .filter(|token| !token.is_empty())
        .map(str::to_string)
        .collect()
}

pub fn new() -> Command {
    let styles = Styles::styled()
        .header(AnsiColor::Yellow.on_default() | Effects::BOLD)
        .usage(AnsiColor::Green.on_default() | Effects::BOLD)
        .literal(AnsiColor::Blue.on_default() | Effects::BOLD)
        .placeholder(AnsiColor::Green.on_default());

    Command::new("spicepack")
        .about("Seal a payload into an encrypted bundle and upload it in parts")
        .version(env!("CARGO_PKG_VERSION"))
        .color(ColorChoice::Auto)
        .styles(styles)
        .arg(
            Arg::new("jwt")
                .short('j')
                .long("jwt")
                .help("Bearer token, or path to a file containing it (required unless --skip-key)")
                .value_name("token|path")
                .num_args(1),
        )
        .arg(
            Arg::new("uuid")
                .long("uuid")
                .help("Project UUID, used when the token does not carry one")
                .value_name("uuid")
                .num_args(1),
        )
        .arg(
            Arg::new("adg")
                .long("adg")
                .help("Directory holding an Artifact Dependency Graph set")
                .value_name("dir")
                .value_parser(validator_is_dir())
                .num_args(1),
        )
        .arg(
            Arg::new("deployment-events")
                .long("deployment-events")
                .help("Single JSON file of deployment events")
                .value_name("file")
                .value_parser(validator_is_file())
                .num_args(1),
        )
        .arg(
            Arg::new("encrypt-only")
                .short('e')
                .long("encrypt-only")
                .help("Build the bundle but do not upload it")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("skip-key")
                .long("skip-key")
                .help("Produce a cleartext bundle; the project id falls back to plaintext_upload")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("comment-no-sensitive-info")
                .long("comment-no-sensitive-info")
                .help("Non-sensitive comment stored inside the bundle")
                .value_name("comment")
                .num_args(1),
        )
        .arg(
            Arg::new("output")
                .long("output")
                .help("Directory for the bundle artifact (default: temp directory)")
                .value_name("dir")
                .value_parser(validator_is_dir())
                .num_args(1),
        )
        .arg(
            Arg::new("bundle-format-version")
                .long("bundle-format-version")
                .help("Bundle format version (default 2: gzip-compressed tar; 1 is legacy, uncompressed)")
                .value_name("1|2")
                .value_parser(["1", "2"])
                .default_value("2")
                .num_args(1),
        )
        .arg(
            Arg::new("extra-args")
                .long("extra-args")
                .help("Comma-separated extra options, e.g. --extra-args --uuid,abc,--encrypt-only")
                .value_name("k=v,...")
                .num_args(1),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .help("Increase log verbosity (-v debug, -vv trace)")
                .action(ArgAction::Count),
        )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(args: &[&str]) -> Vec<String> {
        args.iter().map(|s| (*s).to_string()).collect()
    }

    #[test]
    fn test_expand_extra_args_separate_value() {
        let out = expand_extra_args(argv(&["spicepack", "--extra-args", "--uuid,abc,-e"]));
        assert_eq!(out, argv(&["spicepack", "--uuid", "abc", "-e"]));
    }

    #[test]
    fn test_expand_extra_args_equals_form() {
        let out = expand_extra_args(argv(&["spicepack", "--extra-args=--uuid,abc"]));
        assert_eq!(out, argv(&["spicepack", "--uuid", "abc"]));
    }

    #[test]
    fn test_expand_extra_args_passthrough() {
        let out = expand_extra_args(argv(&["spicepack", "-e", "--uuid", "abc"]));
        assert_eq!(out, argv(&["spicepack", "-e", "--uuid", "abc"]));
    }

    #[test]
    fn test_expanded_value_binds_to_preceding_option() {
        let cmd = new();
        let args = expand_extra_args(argv(&[
            "spicepack",
            "--extra-args",
            "--uuid,from-extra,--encrypt-only",
        ]));
        let matches = cmd.try_get_matches_from(args).unwrap();

        assert_eq!(
            matches.get_one::<String>("uuid").map(String::as_str),
            Some("from-extra")
        );
        assert!(matches.get_flag("encrypt-only"));
    }

    #[test]
    fn test_default_bundle_format_version_is_2() {
        let matches = new().try_get_matches_from(argv(&["spicepack"])).unwrap();
        assert_eq!(
            matches
                .get_one::<String>("bundle-format-version")
                .map(String::as_str),
            Some("2")
        );
    }

    #[test]
    fn test_key_value_token_form() {
        let args = expand_extra_args(argv(&["spicepack", "--extra-args", "--uuid=abc"]));
        let matches = new().try_get_matches_from(args).unwrap();
        assert_eq!(
            matches.get_one::<String>("uuid").map(String::as_str),
            Some("abc")
        );
    }
}
