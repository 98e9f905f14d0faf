pub mod auth;
pub mod logging;
pub mod vault;

use clap::{
    Arg, ArgMatches, ColorChoice, Command,
    builder::styling::{AnsiColor, Effects, Styles},
};

pub const CMD_SERVE: &str = "serve";
pub const CMD_ROTATE_KEYS: &str = "rotate-keys";
pub const ARG_DSN: &str = "dsn";
pub const ARG_PORT: &str = "port";
pub const ARG_PROJECT_ID: &str = "project-id";

#[must_use]
pub fn new() -> Command {
    let styles = Styles::styled()
        .header(AnsiColor::Yellow.on_default() | Effects::BOLD)
        .usage(AnsiColor::Green.on_default() | Effects::BOLD)
        .literal(AnsiColor::Blue.on_default() | Effects::BOLD)
        .placeholder(AnsiColor::Green.on_default());

    let long_version: &'static str = Box::leak(
        format!("{} - {}", env!("CARGO_PKG_VERSION"), crate::GIT_COMMIT_HASH).into_boxed_str(),
    );

    let serve = auth::with_args(
        Command::new(CMD_SERVE).about("Serve the HTTP API").arg(
            Arg::new(ARG_PORT)
                .short('p')
                .long(ARG_PORT)
                .help("Port to listen on")
                .default_value("8080")
                .env("PORTCULLIS_PORT")
                .value_parser(clap::value_parser!(u16)),
        ),
    );

    let rotate_keys = Command::new(CMD_ROTATE_KEYS)
        .about("Create a new signing key for every token class whose current key is due")
        .arg(
            Arg::new(ARG_PROJECT_ID)
                .long(ARG_PROJECT_ID)
                .help("Project id (project_...)")
                .env("PORTCULLIS_PROJECT_ID")
                .required(true),
        );

    let command = Command::new("portcullis")
        .about("Multi-tenant credential issuance and verification")
        .version(env!("CARGO_PKG_VERSION"))
        .long_version(long_version)
        .color(ColorChoice::Auto)
        .styles(styles)
        .subcommand_required(true)
        .arg_required_else_help(true)
        .arg(
            Arg::new(ARG_DSN)
                .short('d')
                .long(ARG_DSN)
                .help("Database connection string")
                .env("PORTCULLIS_DSN")
                .global(true),
        )
        .subcommand(serve)
        .subcommand(rotate_keys);

    let command = vault::with_args(command);
    let command = auth::with_key_policy_args(command);
    logging::with_args(command)
}

/// Matches of the invoked subcommand, where global arguments are always visible.
#[must_use]
pub fn leaf(matches: &ArgMatches) -> &ArgMatches {
    matches.subcommand().map_or(matches, |(_, sub)| sub)
}
