use std::path::Path;

use log4rs::{
    append::{
        console::{ConsoleAppender, Target},
        file::FileAppender,
    },
    config::{Appender, Root},
    encode::pattern::PatternEncoder,
    filter::threshold::ThresholdFilter,
    Config,
};

const LOG_PATTERN: &str = "{h({d(%Y-%m-%d %H:%M:%S)} [{l}] from line {L} in {M})} - {m}{n}";

/// Set up logging to stderr at `level` and, if `log_file` is given, to that file as well.
///
/// The file always records at least DEBUG messages so that a batch run that went wrong
/// overnight can be reconstructed. Panics if the logger cannot be configured, which
/// usually means the log file could not be created.
pub fn init_logging(level: log::LevelFilter, log_file: Option<&Path>) {
    let stderr = ConsoleAppender::builder()
        .encoder(Box::new(PatternEncoder::new(LOG_PATTERN)))
        .target(Target::Stderr)
        .build();

    let mut config = Config::builder().appender(
        Appender::builder()
            .filter(Box::new(ThresholdFilter::new(level)))
            .build("stderr", Box::new(stderr)),
    );
    let mut root = Root::builder().appender("stderr");
    let mut root_level = level;

    if let Some(path) = log_file {
        let file = FileAppender::builder()
            .encoder(Box::new(PatternEncoder::new("{d(%Y-%m-%d %H:%M:%S)} [{l}] {M} - {m}{n}")))
            .append(true)
            .build(path)
            .expect("Failed to create log file");
        config = config.appender(
            Appender::builder()
                .filter(Box::new(ThresholdFilter::new(log::LevelFilter::Debug)))
                .build("file", Box::new(file)),
        );
        root = root.appender("file");
        root_level = root_level.max(log::LevelFilter::Debug);
    }

    let config = config
        .build(root.build(root_level))
        .expect("Failed to configure logger");

    log4rs::init_config(config).expect("Failed to initialize logger");
}
