//! Device discovery and selection.
//!
//! A configured device name is matched exactly; if it is missing the
//! default device is used with a warning rather than failing the call.

use cpal::traits::{DeviceTrait, HostTrait};
use cpal::Device;
use log::warn;

use super::AudioError;

pub fn list_input_devices() -> Vec<String> {
    let host = cpal::default_host();
    match host.input_devices() {
        Ok(devices) => devices.filter_map(|d| d.name().ok()).collect(),
        Err(e) => {
            warn!("failed to enumerate input devices: {}", e);
            Vec::new()
        }
    }
}

pub fn list_output_devices() -> Vec<String> {
    let host = cpal::default_host();
    match host.output_devices() {
        Ok(devices) => devices.filter_map(|d| d.name().ok()).collect(),
        Err(e) => {
            warn!("failed to enumerate output devices: {}", e);
            Vec::new()
        }
    }
}

pub fn find_input_device(preferred: Option<&str>) -> Result<Device, AudioError> {
    let host = cpal::default_host();

    if let Some(name) = preferred {
        match host.input_devices() {
            Ok(mut devices) => {
                if let Some(device) = devices.find(|d| d.name().map(|n| n == name).unwrap_or(false))
                {
                    return Ok(device);
                }
                warn!("input device '{}' not found, using default", name);
            }
            Err(e) => warn!("failed to enumerate input devices: {}", e),
        }
    }

    host.default_input_device().ok_or(AudioError::NoInputDevice)
}

pub fn find_output_device(preferred: Option<&str>) -> Result<Device, AudioError> {
    let host = cpal::default_host();

    if let Some(name) = preferred {
        match host.output_devices() {
            Ok(mut devices) => {
                if let Some(device) = devices.find(|d| d.name().map(|n| n == name).unwrap_or(false))
                {
                    return Ok(device);
                }
                warn!("output device '{}' not found, using default", name);
            }
            Err(e) => warn!("failed to enumerate output devices: {}", e),
        }
    }

    host.default_output_device()
        .ok_or(AudioError::NoOutputDevice)
}
