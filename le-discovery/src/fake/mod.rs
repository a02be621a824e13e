//! A scriptable backend for testing code that uses an [`Adapter`](crate::Adapter)
//! without any Bluetooth hardware.

mod adapter;
pub use adapter::{FakeAdapter, FAKE_ADAPTER_ADDRESS, FAKE_ADAPTER_NAME, FAKE_DEVICE_ADDRESS,
                  FAKE_DEVICE_NAME};
