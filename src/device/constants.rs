/**
 * How often (milliseconds) the state machine is ticked by the run loop.
 */
pub const POLL_DELAY: u64 = 10;

/**
 * How often (milliseconds) the signal strength of a connected peripheral is refreshed.
 */
pub const RSSI_REFRESH_INTERVAL: u64 = 1000;

/**
 * How many times attribute discovery is attempted before giving up.
 */
pub const DISCOVERY_ATTEMPTS: u32 = 3;

/**
 * How long (milliseconds) to let the link settle before and between discovery attempts.
 */
pub const DISCOVERY_SETTLE_DELAY: u64 = 500;

/**
 * How many failures in a row are turned into a reconnect before FAILED is surfaced.
 */
pub const MAX_RECONNECT_ATTEMPTS: u32 = 5;

/**
 * How long (milliseconds) the vibration stays on for the post-connect pulse when no default level is set.
 */
pub const CONFIRMATION_PULSE: u64 = 200;

/**
 * How long (milliseconds) a write to a characteristic may take.
 */
pub const WRITE_DEADLINE: u64 = 2000;

/**
 * How long (milliseconds) checking if the peripheral is still connected may take.
 */
pub const IS_CONNECTED_DEADLINE: u64 = 2000;

/**
 * How many concurrent clients the btleplug host hands out.
 */
pub const MAX_CLIENTS: usize = 3;

/**
 * Capacity of the host event queue and of every subscriber queue.
 */
pub const EVENT_QUEUE_SIZE: usize = 64;

/**
 * Capacity of the queue between a command channel and its writer.
 */
pub const COMMAND_QUEUE_SIZE: usize = 16;
