use std::path::Path;
use std::time::Duration;

use linux_embedded_hal::Serial;
use serial_core::{
    BaudRate, CharSize, FlowControl, Parity, SerialDevice as _, SerialPortSettings as _, StopBits,
};

use crate::Error;

/// Open a linux serial port configured for the bootloader (8N1, no flow control)
pub fn open_serial<P: AsRef<Path>>(
    port: P,
    baud: usize,
    timeout: Duration,
) -> Result<Serial, Error> {
    debug!("Opening serial port {} at {} baud", port.as_ref().display(), baud);

    // Open port
    let mut port = Serial::open(port.as_ref())?;

    // Apply settings
    let mut settings = port.0.read_settings()?;

    settings.set_char_size(CharSize::Bits8);
    settings.set_stop_bits(StopBits::Stop1);
    settings.set_baud_rate(BaudRate::from_speed(baud))?;
    settings.set_flow_control(FlowControl::FlowNone);
    settings.set_parity(Parity::ParityNone);

    port.0.write_settings(&settings)?;
    port.0.set_timeout(timeout)?;

    Ok(port)
}
