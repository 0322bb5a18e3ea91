use {
    tracing::{debug, warn},
    candle::Device,
};

/// Waits for queued device work so that buffers released by dropped models are actually freed.
pub fn clear_memory(device: &Device) {
    if let Err(err) = device.synchronize() {
        warn!("failed to synchronize device: {}", err);
    }
    debug!("cleared memory on {:?}", device);
}

/// Drops a model (or anything else holding device buffers) and clears memory afterwards.
pub fn release<T>(value: T, device: &Device) {
    drop(value);
    clear_memory(device);
}
