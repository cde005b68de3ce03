mod driver;

pub use driver::MqttDeviceDriver;
