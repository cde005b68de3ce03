mod bus;
mod relay;

pub use bus::ModbusBus;
pub use relay::WaveshareRelayDriver;
