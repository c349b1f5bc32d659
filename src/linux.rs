use std::io::{Error as IoError, ErrorKind as IoErrorKind};
use std::path::Path;

use serial_core::{
    BaudRate, CharSize, Error as SerialError, FlowControl, Parity, SerialDevice as _,
    SerialPortSettings as _, StopBits,
};
use linux_embedded_hal::{Delay, Serial};

use crate::{Options, Programmer, SerialPort};

impl SerialPort<IoErrorKind> for Serial {
    fn set_rts(&mut self, level: bool) -> Result<(), IoErrorKind> {
        self.0
            .set_rts(level)
            .map_err(|e| IoError::from(e).kind())
    }
    fn set_dtr(&mut self, level: bool) -> Result<(), IoErrorKind> {
        self.0
            .set_dtr(level)
            .map_err(|e| IoError::from(e).kind())
    }
}

impl Programmer<Serial, Delay, IoErrorKind> {
    /// Create a new linux serial port programmer instance
    pub fn linux<P: AsRef<Path>>(
        port: P,
        baud: usize,
        options: Options,
    ) -> Result<Self, SerialError> {
        let path = port.as_ref();

        // Open port
        let mut port = Serial::open(path)?;

        // Apply settings, the bootloader UART runs 8N2
        let mut settings = port.0.read_settings()?;

        settings.set_char_size(CharSize::Bits8);
        settings.set_stop_bits(StopBits::Stop2);
        settings.set_baud_rate(BaudRate::from_speed(baud))?;
        settings.set_flow_control(FlowControl::FlowNone);
        settings.set_parity(Parity::ParityNone);

        port.0.write_settings(&settings)?;

        debug!("Opened {} at {} baud", path.display(), baud);

        // Return instance
        Ok(Self::new(port, Delay {}, options))
    }
}
