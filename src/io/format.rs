//! Nice NPDM output formatting.

use std::fmt;

use log;

const NPDM_BANNER_LENGTH: usize = 79;

/// Logs an error to the `npdm-output` logger.
macro_rules! npdm_error {
    ($fmt:expr $(, $($arg:tt)*)?) => {
        log::error!($fmt, $($($arg)*)?);
        log::error!(target: "npdm-output", $fmt, $($($arg)*)?);
    }
}

/// Logs a warning to the `npdm-output` logger.
macro_rules! npdm_warn {
    ($fmt:expr $(, $($arg:tt)*)?) => { log::warn!(target: "npdm-output", $fmt, $($($arg)*)?); }
}

/// Logs a main output line to the `npdm-output` logger.
macro_rules! npdm_output {
    ($fmt:expr $(, $($arg:tt)*)?) => { log::info!(target: "npdm-output", $fmt, $($($arg)*)?); }
}

pub(crate) use {npdm_error, npdm_output, npdm_warn};

/// Logs a nicely formatted section title to the `npdm-output` logger.
pub(crate) fn log_title(title: &str) {
    let length = title.chars().count().max(NPDM_BANNER_LENGTH - 6);
    let bar = "─".repeat(length);
    npdm_output!("┌──{bar}──┐");
    npdm_output!("│§ {title:^length$} §│");
    npdm_output!("└──{bar}──┘");
}

/// Writes a nicely formatted subtitle.
pub(crate) fn write_subtitle(f: &mut fmt::Formatter<'_>, subtitle: &str) -> fmt::Result {
    let length = subtitle.chars().count();
    let bar = "═".repeat(length);
    writeln!(f, "{subtitle}")?;
    writeln!(f, "{bar}")?;
    Ok(())
}

/// Logs a nicely formatted subtitle to the `npdm-output` logger.
pub(crate) fn log_subtitle(subtitle: &str) {
    let length = subtitle.chars().count();
    let bar = "═".repeat(length);
    npdm_output!("{}", subtitle);
    npdm_output!("{}", bar);
}

/// Logs a nicely formatted micro-section beginning to the `npdm-output` logger.
pub(crate) fn log_micsec_begin(sectitle: &str) {
    let width = NPDM_BANNER_LENGTH - 14;
    let sectitle_space = sectitle.to_string() + " ";
    npdm_output!("‹‹‹‹‹ [Begin] {sectitle_space:‹<width$}");
}

/// Logs a nicely formatted micro-section ending to the `npdm-output` logger.
pub(crate) fn log_micsec_end(sectitle: &str) {
    let width = NPDM_BANNER_LENGTH - 14;
    let sectitle_space = sectitle.to_string() + " ";
    npdm_output!("››››› [ End ] {sectitle_space:›<width$}");
}

/// Turns a boolean into a string of `yes` or `no`.
pub(crate) fn nice_bool(b: bool) -> String {
    if b {
        "yes".to_string()
    } else {
        "no".to_string()
    }
}

/// A trait for logging NPDM outputs nicely.
pub(crate) trait NpdmOutput: fmt::Debug + fmt::Display {
    /// Logs display output nicely.
    fn log_output_display(&self) {
        let lines = self.to_string();
        lines.lines().for_each(|line| {
            npdm_output!("{line}");
        })
    }
}

// Blanket implementation
impl<T> NpdmOutput for T where T: fmt::Debug + fmt::Display {}
