//! Heap and command-buffer settings loaded from environment variables.
//!
//! Every value falls back to its default when the variable is missing or
//! cannot be parsed.
//!
//! | Variable | Default | Description |
//! |---|---|---|
//! | `GSH_DSH_INITIAL_SIZE` | 524288 | First dynamic-state heap (bytes) |
//! | `GSH_DSH_EXTEND_SIZE` | 524288 | Growth step of the dynamic-state heap |
//! | `GSH_DSH_BEHAVIOR` | `waitAndExtend` | Policy when the DSH is full |
//! | `GSH_ISH_INITIAL_SIZE` | 1048576 | First instruction heap (bytes) |
//! | `GSH_ISH_EXPAND_STEP` | 65536 | Instruction heap growth granularity |
//! | `GSH_ISH_MAX_SIZE` | 16777216 | Largest instruction heap |
//! | `GSH_KERNEL_PADDING` | 64 | Zeroed bytes after every kernel |
//! | `GSH_KERNEL_ALIGNMENT` | 64 | Kernel start alignment |
//! | `GSH_WAIT_STEP_MS` | 10 | Poll interval of the `wait` behavior |
//! | `GSH_WAIT_TIMEOUT_MS` | 100 | Give-up time of the `wait` behavior |
//! | `GSH_LOCK_HEAPS` | false | Keep heaps CPU-mapped for their lifetime |
//! | `GSH_CMD_BUFFER_SIZE` | 65536 | Command buffer size, SSH included |
//! | `GSH_SSH_SIZE` | 16384 | SSH region at the command buffer tail |
//! | `GSH_TRACKER_SLOTS` | 64 | Frame tracker producer slots |
//! | `GSH_DEDICATED_SCRATCH` | false | Scratch in its own allocation |

use std::time::Duration;

use crate::runtime::heap::Behavior;

#[derive(Debug, Clone)]
pub struct StateHeapSettings {
    pub dsh_initial_size: usize,
    pub dsh_extend_size: usize,
    pub dsh_behavior: Behavior,
    pub ish_initial_size: usize,
    pub ish_expand_step: usize,
    pub ish_max_size: usize,
    pub kernel_padding: usize,
    pub kernel_alignment: usize,
    pub wait_step: Duration,
    pub wait_timeout: Duration,
    pub lock_heaps: bool,
    pub command_buffer_size: usize,
    pub ssh_size: usize,
    pub tracker_slots: usize,
    pub dedicated_scratch: bool,
}

impl Default for StateHeapSettings {
    fn default() -> Self {
        Self {
            dsh_initial_size: 512 * 1024,
            dsh_extend_size: 512 * 1024,
            dsh_behavior: Behavior::WaitAndExtend,
            ish_initial_size: 1024 * 1024,
            ish_expand_step: 64 * 1024,
            ish_max_size: 16 * 1024 * 1024,
            kernel_padding: 64,
            kernel_alignment: 64,
            wait_step: Duration::from_millis(10),
            wait_timeout: Duration::from_millis(100),
            lock_heaps: false,
            command_buffer_size: 64 * 1024,
            ssh_size: 16 * 1024,
            tracker_slots: 64,
            dedicated_scratch: false,
        }
    }
}

impl StateHeapSettings {
    #[must_use]
    pub fn from_env() -> Self {
        let d = Self::default();

        let dsh_initial_size = parse_usize("GSH_DSH_INITIAL_SIZE", d.dsh_initial_size).max(1);
        let dsh_extend_size = parse_usize("GSH_DSH_EXTEND_SIZE", d.dsh_extend_size).max(1);
        let dsh_behavior = std::env::var("GSH_DSH_BEHAVIOR")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(d.dsh_behavior);

        let ish_initial_size = parse_usize("GSH_ISH_INITIAL_SIZE", d.ish_initial_size).max(1);
        let ish_max_size = parse_usize("GSH_ISH_MAX_SIZE", d.ish_max_size).max(ish_initial_size);
        let ish_expand_step = parse_usize("GSH_ISH_EXPAND_STEP", d.ish_expand_step).max(4096);

        let command_buffer_size = parse_usize("GSH_CMD_BUFFER_SIZE", d.command_buffer_size);
        let ssh_size = parse_usize("GSH_SSH_SIZE", d.ssh_size);
        // the SSH lives inside the command buffer; keep room for commands
        let command_buffer_size = command_buffer_size.max(ssh_size + 4096);

        Self {
            dsh_initial_size,
            dsh_extend_size,
            dsh_behavior,
            ish_initial_size,
            ish_expand_step,
            ish_max_size,
            kernel_padding: parse_usize("GSH_KERNEL_PADDING", d.kernel_padding),
            kernel_alignment: parse_usize("GSH_KERNEL_ALIGNMENT", d.kernel_alignment).max(1),
            wait_step: Duration::from_millis(parse_u64("GSH_WAIT_STEP_MS", 10).max(1)),
            wait_timeout: Duration::from_millis(parse_u64("GSH_WAIT_TIMEOUT_MS", 100)),
            lock_heaps: parse_bool("GSH_LOCK_HEAPS", d.lock_heaps),
            command_buffer_size,
            ssh_size,
            tracker_slots: parse_usize("GSH_TRACKER_SLOTS", d.tracker_slots).max(1),
            dedicated_scratch: parse_bool("GSH_DEDICATED_SCRATCH", d.dedicated_scratch),
        }
    }
}

fn parse_usize(key: &str, default: usize) -> usize {
    match std::env::var(key) {
        Ok(val) => val.parse::<usize>().unwrap_or(default),
        Err(_) => default,
    }
}

fn parse_u64(key: &str, default: u64) -> u64 {
    match std::env::var(key) {
        Ok(val) => val.parse::<u64>().unwrap_or(default),
        Err(_) => default,
    }
}

fn parse_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(val) => match val.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => true,
            "0" | "false" | "no" | "off" => false,
            _ => default,
        },
        Err(_) => default,
    }
}
