//! Destructive-operation confirmation.
//!
//! Shown once, on a fresh install, before anything is written to disk or to
//! the state directory. A resumed run never asks again.

use std::io::{BufRead, Write};
use tracing::info;

use crate::error::{InstallError, Result};

/// Ask the operator to type `yes` before the device is wiped.
pub fn confirm_destructive<R: BufRead, W: Write>(device: &str, mut input: R, mut output: W) -> Result<()> {
    let declined = || InstallError::ConfirmationDeclined {
        device: device.to_string(),
    };

    writeln!(output)
        .and_then(|_| writeln!(output, "WARNING: all data on {device} will be destroyed."))
        .and_then(|_| write!(output, "Type 'yes' to continue: "))
        .and_then(|_| output.flush())
        .map_err(|_| declined())?;

    let mut answer = String::new();
    match input.read_line(&mut answer) {
        Ok(0) | Err(_) => Err(declined()),
        Ok(_) if answer.trim() == "yes" => {
            info!("Destructive install on {} confirmed", device);
            Ok(())
        }
        Ok(_) => Err(declined()),
    }
}
