use crate::{
    Error, Result,
    cli::actions::{Action, MIME_ADG, MIME_DEPLOYMENT_EVENTS},
    payload::BundleVersion,
    token,
};
use clap::ArgMatches;
use std::path::PathBuf;

// turn the matches into the one action this tool performs, rejecting
// invalid flag combinations up front
pub fn dispatch(matches: &ArgMatches) -> Result<Action> {
    let adg = matches.get_one::<PathBuf>("adg");
    let events = matches.get_one::<PathBuf>("deployment-events");

    let (input, mime) = match (adg, events) {
        (Some(dir), None) => (dir.clone(), MIME_ADG),
        (None, Some(file)) => (file.clone(), MIME_DEPLOYMENT_EVENTS),
        (Some(_), Some(_)) => {
            return Err(Error::BadInput(
                "--adg and --deployment-events are mutually exclusive".to_string(),
            ));
        }
        (None, None) => {
            return Err(Error::BadInput(
                "one of --adg or --deployment-events is required".to_string(),
            ));
        }
    };

    let encrypt_only = matches.get_flag("encrypt-only");
    let skip_key = matches.get_flag("skip-key");

    let token_arg = matches.get_one::<String>("jwt");
    if token_arg.is_none() && !skip_key {
        return Err(Error::BadInput(
            "--jwt is required unless --skip-key is given".to_string(),
        ));
    }
    if token_arg.is_none() && !encrypt_only {
        // the upload destination and expiry only exist inside a token
        return Err(Error::BadInput("--jwt is required to upload".to_string()));
    }

    let jwt = token_arg
        .map(|arg| token::resolve_token(arg))
        .transpose()?;

    let version: BundleVersion = matches
        .get_one::<String>("bundle-format-version")
        .map_or(Ok(BundleVersion::default()), |v| v.parse())?;

    Ok(Action::Seal {
        jwt,
        uuid: matches.get_one::<String>("uuid").cloned(),
        input,
        mime,
        encrypt_only,
        skip_key,
        comment: matches.get_one::<String>("comment-no-sensitive-info").cloned(),
        output: matches.get_one::<PathBuf>("output").cloned(),
        version,
    })
}
