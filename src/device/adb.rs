//! Helpers for devices running the OS with ADB

use super::commands::{ADB_REBOOT_BOOTLOADER, PROP_MODEL, PROP_RELEASE, SHELL_BATTERY_LEVEL};
use super::session::{DeviceSession, PendingReconnect};
use crate::error::{Error, Result};
use crate::types::{DeviceInfo, Protocol};

/// Read model, Android release and battery level.
///
/// Values the device does not report are left empty.
pub async fn fetch_info(session: &mut DeviceSession) -> Result<DeviceInfo> {
    ensure_adb(session)?;

    let model = session.try_variable(PROP_MODEL).await.filter(|v| !v.is_empty());
    let android_version = session.try_variable(PROP_RELEASE).await.filter(|v| !v.is_empty());
    let battery_level = session
        .try_variable(SHELL_BATTERY_LEVEL)
        .await
        .and_then(|v| v.trim().parse::<u8>().ok());

    Ok(DeviceInfo {
        model,
        android_version,
        battery_level,
    })
}

/// Reboot an ADB device into the bootloader
pub async fn reboot_to_bootloader(session: DeviceSession) -> Result<PendingReconnect> {
    ensure_adb(&session)?;
    session.reboot(ADB_REBOOT_BOOTLOADER).await
}

fn ensure_adb(session: &DeviceSession) -> Result<()> {
    if session.mode().protocol() != Protocol::Adb {
        return Err(Error::DeviceState(format!(
            "device is in {} mode, ADB required",
            session.mode()
        )));
    }
    Ok(())
}
