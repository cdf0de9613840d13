//! Flag files for Segmenter and Reassembler.
//!
//! The on-disk format is INI-style sections with `key = value` bodies,
//! parsed with the `toml` crate:
//!
//! ```text
//! [general]
//! useCP = true
//!
//! [control-plane]
//! syncPeriodMS = 1000
//!
//! [data-plane]
//! mtu = 9000
//!
//! [pid]
//! Kp = 0.5
//! ```
//!
//! Unknown keys are ignored; absent keys keep the flag defaults. Key names
//! match the file grammar rather than Rust conventions.

use serde::Deserialize;

use crate::error::{E2sarError, Result};

#[derive(Debug, Default, Clone, Deserialize)]
pub struct FlagFile {
    #[serde(default)]
    pub general: GeneralSection,
    #[serde(default, rename = "control-plane")]
    pub control_plane: ControlPlaneSection,
    #[serde(default, rename = "data-plane")]
    pub data_plane: DataPlaneSection,
    #[serde(default)]
    pub pid: PidSection,
}

#[derive(Debug, Default, Clone, Deserialize)]
pub struct GeneralSection {
    #[serde(rename = "useCP")]
    pub use_cp: Option<bool>,
}

#[derive(Debug, Default, Clone, Deserialize)]
pub struct ControlPlaneSection {
    #[serde(rename = "useHostAddress")]
    pub use_host_address: Option<bool>,
    #[serde(rename = "validateCert")]
    pub validate_cert: Option<bool>,
    #[serde(rename = "syncPeriodMS")]
    pub sync_period_ms: Option<u16>,
    #[serde(rename = "syncPeriods")]
    pub sync_periods: Option<u16>,
    #[serde(rename = "warmUpMS")]
    pub warm_up_ms: Option<u16>,
    #[serde(rename = "periodMS")]
    pub period_ms: Option<u16>,
}

#[derive(Debug, Default, Clone, Deserialize)]
pub struct DataPlaneSection {
    #[serde(rename = "dpV6")]
    pub dp_v6: Option<bool>,
    #[serde(rename = "connectedSocket")]
    pub connected_socket: Option<bool>,
    pub mtu: Option<u16>,
    #[serde(rename = "numSendSockets")]
    pub num_send_sockets: Option<usize>,
    #[serde(rename = "sndSocketBufSize")]
    pub snd_socket_buf_size: Option<usize>,
    #[serde(rename = "rateGbps")]
    pub rate_gbps: Option<f32>,
    pub smooth: Option<bool>,
    #[serde(rename = "multiPort")]
    pub multi_port: Option<bool>,
    #[serde(rename = "usecAsEventNum")]
    pub usec_as_event_num: Option<bool>,
    #[serde(rename = "portRange")]
    pub port_range: Option<i32>,
    #[serde(rename = "withLBHeader")]
    pub with_lb_header: Option<bool>,
    #[serde(rename = "eventTimeoutMS")]
    pub event_timeout_ms: Option<u32>,
    #[serde(rename = "rcvSocketBufSize")]
    pub rcv_socket_buf_size: Option<usize>,
    #[serde(rename = "epochMS")]
    pub epoch_ms: Option<u32>,
}

#[derive(Debug, Default, Clone, Deserialize)]
pub struct PidSection {
    #[serde(rename = "setPoint")]
    pub set_point: Option<f32>,
    #[serde(rename = "Kp")]
    pub kp: Option<f32>,
    #[serde(rename = "Ki")]
    pub ki: Option<f32>,
    #[serde(rename = "Kd")]
    pub kd: Option<f32>,
    pub weight: Option<f32>,
    pub min_factor: Option<f32>,
    pub max_factor: Option<f32>,
}

impl FlagFile {
    pub fn load(path: &str) -> Result<FlagFile> {
        let text = std::fs::read_to_string(path).map_err(|_| {
            E2sarError::NotFound(format!("unable to find flags configuration file {}", path))
        })?;
        Self::parse(&text).map_err(|e| {
            E2sarError::ParameterNotAvailable(format!(
                "unable to parse the flags configuration file {}: {}",
                path, e
            ))
        })
    }

    pub fn parse(text: &str) -> std::result::Result<FlagFile, toml::de::Error> {
        toml::from_str(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_all_sections() {
        let f = FlagFile::parse(
            r#"
[general]
useCP = false

[control-plane]
syncPeriodMS = 500
syncPeriods = 4
validateCert = false

[data-plane]
mtu = 9000
numSendSockets = 8
rateGbps = 2.5
portRange = 3

[pid]
Kp = 0.75
setPoint = 0.4
min_factor = 0.25
"#,
        )
        .unwrap();
        assert_eq!(f.general.use_cp, Some(false));
        assert_eq!(f.control_plane.sync_period_ms, Some(500));
        assert_eq!(f.control_plane.sync_periods, Some(4));
        assert_eq!(f.control_plane.validate_cert, Some(false));
        assert_eq!(f.data_plane.mtu, Some(9000));
        assert_eq!(f.data_plane.num_send_sockets, Some(8));
        assert_eq!(f.data_plane.rate_gbps, Some(2.5));
        assert_eq!(f.data_plane.port_range, Some(3));
        assert_eq!(f.pid.kp, Some(0.75));
        assert_eq!(f.pid.set_point, Some(0.4));
        assert_eq!(f.pid.min_factor, Some(0.25));
    }

    #[test]
    fn test_absent_sections_and_unknown_keys() {
        let f = FlagFile::parse(
            r#"
[data-plane]
mtu = 1500
someFutureKnob = 17
"#,
        )
        .unwrap();
        assert_eq!(f.data_plane.mtu, Some(1500));
        assert!(f.general.use_cp.is_none());
        assert!(f.pid.kp.is_none());
    }

    #[test]
    fn test_empty_file() {
        let f = FlagFile::parse("").unwrap();
        assert!(f.data_plane.mtu.is_none());
    }

    #[test]
    fn test_load_missing_file() {
        let e = FlagFile::load("/nonexistent/e2sar_flags.ini").unwrap_err();
        assert!(matches!(e, E2sarError::NotFound(_)));
    }
}
