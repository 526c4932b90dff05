//! HTTP/2 settings management
//!
//! This module implements HTTP/2 SETTINGS parameters as defined in
//! RFC 9113 Section 6.5, and the fixed settings the harness server announces.

use super::error::{Error, Result};
use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;

/// Concurrent stream limit announced by the server
pub const SERVER_MAX_CONCURRENT_STREAMS: u32 = 100;

/// Initial stream window announced by the server
pub const SERVER_INITIAL_WINDOW_SIZE: u32 = 65535;

/// HTTP/2 settings parameters (RFC 9113 Section 6.5.2)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum SettingsParameter {
    /// SETTINGS_HEADER_TABLE_SIZE (0x1)
    HeaderTableSize = 0x1,
    /// SETTINGS_ENABLE_PUSH (0x2)
    EnablePush = 0x2,
    /// SETTINGS_MAX_CONCURRENT_STREAMS (0x3)
    MaxConcurrentStreams = 0x3,
    /// SETTINGS_INITIAL_WINDOW_SIZE (0x4)
    InitialWindowSize = 0x4,
    /// SETTINGS_MAX_FRAME_SIZE (0x5)
    MaxFrameSize = 0x5,
    /// SETTINGS_MAX_HEADER_LIST_SIZE (0x6)
    MaxHeaderListSize = 0x6,
}

impl SettingsParameter {
    /// Convert to u16
    pub fn as_u16(self) -> u16 {
        self as u16
    }

    /// Create from u16
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            0x1 => Some(SettingsParameter::HeaderTableSize),
            0x2 => Some(SettingsParameter::EnablePush),
            0x3 => Some(SettingsParameter::MaxConcurrentStreams),
            0x4 => Some(SettingsParameter::InitialWindowSize),
            0x5 => Some(SettingsParameter::MaxFrameSize),
            0x6 => Some(SettingsParameter::MaxHeaderListSize),
            _ => None,
        }
    }

    /// Get parameter name
    pub fn name(&self) -> &'static str {
        match self {
            SettingsParameter::HeaderTableSize => "HEADER_TABLE_SIZE",
            SettingsParameter::EnablePush => "ENABLE_PUSH",
            SettingsParameter::MaxConcurrentStreams => "MAX_CONCURRENT_STREAMS",
            SettingsParameter::InitialWindowSize => "INITIAL_WINDOW_SIZE",
            SettingsParameter::MaxFrameSize => "MAX_FRAME_SIZE",
            SettingsParameter::MaxHeaderListSize => "MAX_HEADER_LIST_SIZE",
        }
    }
}

impl fmt::Display for SettingsParameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (0x{:x})", self.name(), self.as_u16())
    }
}

/// HTTP/2 settings
///
/// Every field is optional: `None` means the parameter is absent from the
/// frame and the protocol default applies.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Settings {
    /// Header table size (default: 4096)
    pub header_table_size: Option<u32>,
    /// Enable server push (default: true)
    pub enable_push: Option<bool>,
    /// Maximum concurrent streams (default: unlimited)
    pub max_concurrent_streams: Option<u32>,
    /// Initial window size (default: 65535)
    pub initial_window_size: Option<u32>,
    /// Maximum frame size (default: 16384, range: 16384-16777215)
    pub max_frame_size: Option<u32>,
    /// Maximum header list size (default: unlimited)
    pub max_header_list_size: Option<u32>,
}

impl Settings {
    /// Settings the harness server sends right after the client preface
    pub fn server_initial() -> Self {
        Settings {
            max_concurrent_streams: Some(SERVER_MAX_CONCURRENT_STREAMS),
            initial_window_size: Some(SERVER_INITIAL_WINDOW_SIZE),
            ..Settings::default()
        }
    }

    /// Get max frame size (with default)
    pub fn get_max_frame_size(&self) -> u32 {
        self.max_frame_size.unwrap_or(16384)
    }

    /// Validate settings values
    pub fn validate(&self) -> Result<()> {
        if let Some(initial_window_size) = self.initial_window_size {
            if initial_window_size > 0x7FFFFFFF {
                return Err(Error::InvalidSettings(format!(
                    "Initial window size {} exceeds maximum (2^31-1)",
                    initial_window_size
                )));
            }
        }

        if let Some(max_frame_size) = self.max_frame_size {
            if !(16384..=16777215).contains(&max_frame_size) {
                return Err(Error::InvalidSettings(format!(
                    "Max frame size {} outside valid range (16384-16777215)",
                    max_frame_size
                )));
            }
        }

        Ok(())
    }

    /// Parse a SETTINGS payload
    ///
    /// Unknown identifiers are ignored (RFC 9113 Section 6.5.2).
    pub fn decode(payload: &[u8]) -> Result<Self> {
        if payload.len() % 6 != 0 {
            return Err(Error::FrameSize(format!(
                "SETTINGS payload length {} is not a multiple of 6",
                payload.len()
            )));
        }

        let mut settings = Settings::default();
        for entry in payload.chunks_exact(6) {
            let id = u16::from_be_bytes([entry[0], entry[1]]);
            let value = u32::from_be_bytes([entry[2], entry[3], entry[4], entry[5]]);

            match SettingsParameter::from_u16(id) {
                Some(SettingsParameter::HeaderTableSize) => settings.header_table_size = Some(value),
                Some(SettingsParameter::EnablePush) => {
                    if value > 1 {
                        return Err(Error::InvalidSettings(format!("ENABLE_PUSH value {}", value)));
                    }
                    settings.enable_push = Some(value == 1);
                }
                Some(SettingsParameter::MaxConcurrentStreams) => {
                    settings.max_concurrent_streams = Some(value)
                }
                Some(SettingsParameter::InitialWindowSize) => {
                    settings.initial_window_size = Some(value)
                }
                Some(SettingsParameter::MaxFrameSize) => settings.max_frame_size = Some(value),
                Some(SettingsParameter::MaxHeaderListSize) => {
                    settings.max_header_list_size = Some(value)
                }
                None => {}
            }
        }

        settings.validate()?;
        Ok(settings)
    }

    /// Serialize the parameters that are present into a SETTINGS payload
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(36);
        let mut put = |param: SettingsParameter, value: u32| {
            buf.put_u16(param.as_u16());
            buf.put_u32(value);
        };

        if let Some(val) = self.header_table_size {
            put(SettingsParameter::HeaderTableSize, val);
        }
        if let Some(val) = self.enable_push {
            put(SettingsParameter::EnablePush, u32::from(val));
        }
        if let Some(val) = self.max_concurrent_streams {
            put(SettingsParameter::MaxConcurrentStreams, val);
        }
        if let Some(val) = self.initial_window_size {
            put(SettingsParameter::InitialWindowSize, val);
        }
        if let Some(val) = self.max_frame_size {
            put(SettingsParameter::MaxFrameSize, val);
        }
        if let Some(val) = self.max_header_list_size {
            put(SettingsParameter::MaxHeaderListSize, val);
        }

        buf.freeze()
    }

    /// Merge settings from another Settings object
    /// (values in `other` override values in `self`)
    pub fn merge(&mut self, other: &Settings) {
        if other.header_table_size.is_some() {
            self.header_table_size = other.header_table_size;
        }
        if other.enable_push.is_some() {
            self.enable_push = other.enable_push;
        }
        if other.max_concurrent_streams.is_some() {
            self.max_concurrent_streams = other.max_concurrent_streams;
        }
        if other.initial_window_size.is_some() {
            self.initial_window_size = other.initial_window_size;
        }
        if other.max_frame_size.is_some() {
            self.max_frame_size = other.max_frame_size;
        }
        if other.max_header_list_size.is_some() {
            self.max_header_list_size = other.max_header_list_size;
        }
    }
}
