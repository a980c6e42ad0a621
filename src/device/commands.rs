//! Variable and command names sent to the device

/// Product name; read as the liveness probe
pub const VAR_PRODUCT: &str = "product";
/// Bootloader lock state (`yes` / `no`)
pub const VAR_UNLOCKED: &str = "unlocked";
/// `yes` while running fastbootd
pub const VAR_IS_USERSPACE: &str = "is-userspace";
/// Reserved ADB variable carrying the connection state
pub const VAR_ADB_STATE: &str = "adb:state";

/// Variables polled so often that they are only traced
pub const POLLING_VARS: [&str; 3] = [VAR_PRODUCT, VAR_UNLOCKED, VAR_IS_USERSPACE];

/// Unlock command
pub const FLASHING_UNLOCK: &str = "flashing unlock";
/// Unlock command on older bootloaders
pub const OEM_UNLOCK: &str = "oem unlock";
/// Lock command
pub const FLASHING_LOCK: &str = "flashing lock";

/// Switch to the classic bootloader
pub const REBOOT_BOOTLOADER: &str = "reboot-bootloader";
/// Switch to fastbootd
pub const REBOOT_FASTBOOT: &str = "reboot-fastboot";
/// Boot into recovery
pub const REBOOT_RECOVERY: &str = "reboot-recovery";
/// Boot the OS
pub const REBOOT: &str = "reboot";

/// Partition holding the custom AVB key
pub const AVB_CUSTOM_KEY: &str = "avb_custom_key";
/// Erase the custom key slot
pub const ERASE_AVB_CUSTOM_KEY: &str = "erase:avb_custom_key";
/// Partitions erased when wiping user data
pub const WIPE_PARTITIONS: [&str; 2] = ["userdata", "metadata"];

/// ADB service rebooting into the bootloader
pub const ADB_REBOOT_BOOTLOADER: &str = "reboot:bootloader";
/// ADB service rebooting into the OS
pub const ADB_REBOOT: &str = "reboot:";
/// ADB property with the model name
pub const PROP_MODEL: &str = "ro.product.model";
/// ADB property with the Android release
pub const PROP_RELEASE: &str = "ro.build.version.release";
/// ADB shell command printing the battery level
pub const SHELL_BATTERY_LEVEL: &str = "shell:cmd battery get level";
