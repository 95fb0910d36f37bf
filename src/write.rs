//! Functions for writing messages.
//!
//! Copyright (c) Microsoft Corporation.
//! Licensed under the MIT license.
use std::fmt::Display;
use std::io::{self, Write};
use termcolor::{Color, ColorChoice, ColorSpec, StandardStream, WriteColor};

fn msg(label: &str, message: impl Display, color: &ColorSpec, indent: usize) -> io::Result<()> {
    let mut stderr = StandardStream::stderr(ColorChoice::Auto);
    stderr.set_color(color)?;
    write!(&mut stderr, "{:>width$} ", label, width = 20 + indent)?;
    stderr.set_color(ColorSpec::new().set_fg(None))?;
    writeln!(&mut stderr, "{}", message)?;
    Ok(())
}

/// Write an ok message to stderr
///
/// # Errors
///
/// Will return `Err` if a problem is encountered writing to stderr
pub fn ok(label: &str, message: impl Display) -> io::Result<()> {
    msg(label, message, ColorSpec::new().set_fg(Some(Color::Green)), 0)
}

/// Write an ok message nested one level below the current section
pub fn nested(label: &str, message: impl Display) -> io::Result<()> {
    msg(label, message, ColorSpec::new().set_fg(Some(Color::Cyan)), 4)
}

/// Write a warning message to stderr
pub fn warn(label: &str, message: impl Display) -> io::Result<()> {
    msg(
        label,
        message,
        ColorSpec::new().set_fg(Some(Color::Yellow)).set_bold(true),
        0,
    )
}

/// Write an error message to stderr
///
/// # Errors
///
/// Will return `Err` if a problem is encountered writing to stderr
pub fn error(label: &str, message: impl Display) -> io::Result<()> {
    msg(
        label,
        message,
        ColorSpec::new().set_fg(Some(Color::Red)).set_bold(true),
        0,
    )
}
