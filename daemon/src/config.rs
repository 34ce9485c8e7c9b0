use anyhow::{bail, Result};
use std::path::PathBuf;

pub const USAGE: &str = "\
lidlock-daemon — locks the session and/or runs a script when the laptop lid closes

USAGE:
    lidlock-daemon [FLAGS]

FLAGS:
    -run <path>    Launch <path> on a lid-close / display-off transition
    -lock          Lock the interactive session on a closing transition
    -log <path>    Append timestamped event lines to <path>
    -kill          Ask a running instance to terminate, then exit
    -help          Print this help text

With no flags the agent defaults to locking the session on lid close.";

/// Runtime configuration, built from the command line only.
/// There is no configuration file.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Config {
    /// Script launched (fire-and-forget) on each closing transition.
    pub run_script: Option<PathBuf>,
    /// Whether a closing transition locks the session. Even when false,
    /// the reaction engine falls back to locking if `run_script` is also
    /// unset — an unconfigured agent still locks on lid close.
    pub lock_on_close: bool,
    /// Destination for timestamped log lines, if any.
    pub log_file: Option<PathBuf>,
    /// `-kill`: signal a running instance to terminate instead of becoming one.
    pub kill_requested: bool,
}

/// Outcome of command-line parsing.
#[derive(Debug, PartialEq)]
pub enum ParsedArgs {
    Run(Config),
    /// `-help` was given; the caller prints [`USAGE`] and exits 0.
    Help,
}

/// Parses argv (without the program name). Unknown flags and flags missing
/// their value are usage errors; the caller prints the error plus [`USAGE`]
/// and exits non-zero without entering the main loop.
pub fn parse_args<I>(args: I) -> Result<ParsedArgs>
where
    I: IntoIterator<Item = String>,
{
    let mut config = Config::default();
    let mut args = args.into_iter();

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-help" | "--help" => return Ok(ParsedArgs::Help),
            "-run" | "--run" => match args.next() {
                Some(path) => config.run_script = Some(PathBuf::from(path)),
                None => bail!("flag -run requires a script path"),
            },
            "-log" | "--log" => match args.next() {
                Some(path) => config.log_file = Some(PathBuf::from(path)),
                None => bail!("flag -log requires a file path"),
            },
            "-lock" | "--lock" => config.lock_on_close = true,
            "-kill" | "--kill" => config.kill_requested = true,
            other => bail!("unrecognized flag: {other}"),
        }
    }

    Ok(ParsedArgs::Run(config))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<ParsedArgs> {
        parse_args(args.iter().map(|s| s.to_string()))
    }

    fn parse_config(args: &[&str]) -> Config {
        match parse(args).unwrap() {
            ParsedArgs::Run(c) => c,
            ParsedArgs::Help => panic!("expected a config, got Help"),
        }
    }

    // ── defaults ──────────────────────────────────────────────────────────────

    #[test]
    fn no_flags_yields_default_config() {
        let config = parse_config(&[]);
        assert_eq!(config, Config::default());
        assert!(config.run_script.is_none());
        assert!(!config.lock_on_close);
        assert!(config.log_file.is_none());
        assert!(!config.kill_requested);
    }

    // ── individual flags ──────────────────────────────────────────────────────

    #[test]
    fn run_flag_takes_a_path() {
        let config = parse_config(&["-run", "/usr/local/bin/on-lid-close.sh"]);
        assert_eq!(
            config.run_script.as_deref(),
            Some(std::path::Path::new("/usr/local/bin/on-lid-close.sh"))
        );
    }

    #[test]
    fn lock_flag_sets_lock_on_close() {
        assert!(parse_config(&["-lock"]).lock_on_close);
    }

    #[test]
    fn log_flag_takes_a_path() {
        let config = parse_config(&["-log", "/var/log/lidlock.log"]);
        assert_eq!(
            config.log_file.as_deref(),
            Some(std::path::Path::new("/var/log/lidlock.log"))
        );
    }

    #[test]
    fn kill_flag_sets_kill_requested() {
        assert!(parse_config(&["-kill"]).kill_requested);
    }

    #[test]
    fn flags_combine() {
        let config = parse_config(&["-run", "script.sh", "-lock", "-log", "out.log"]);
        assert!(config.run_script.is_some());
        assert!(config.lock_on_close);
        assert!(config.log_file.is_some());
        assert!(!config.kill_requested);
    }

    #[test]
    fn double_dash_spellings_accepted() {
        let config = parse_config(&["--lock", "--run", "s.sh"]);
        assert!(config.lock_on_close);
        assert!(config.run_script.is_some());
    }

    // ── help ──────────────────────────────────────────────────────────────────

    #[test]
    fn help_flag_wins_immediately() {
        assert_eq!(parse(&["-help"]).unwrap(), ParsedArgs::Help);
        // Even with other flags before it.
        assert_eq!(parse(&["-lock", "-help"]).unwrap(), ParsedArgs::Help);
    }

    // ── usage errors ──────────────────────────────────────────────────────────

    #[test]
    fn unknown_flag_is_an_error() {
        assert!(parse(&["-frobnicate"]).is_err());
    }

    #[test]
    fn run_without_value_is_an_error() {
        assert!(parse(&["-run"]).is_err());
    }

    #[test]
    fn log_without_value_is_an_error() {
        assert!(parse(&["-lock", "-log"]).is_err());
    }

    #[test]
    fn bare_positional_argument_is_an_error() {
        assert!(parse(&["script.sh"]).is_err());
    }
}
