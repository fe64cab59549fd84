use crate::Result;

/// Out-of-band key/value exchange carried by the `set`/`get` control calls.
pub trait Properties: Send + Sync + 'static {
    fn set(&self, name: &str, value: &str) -> Result<()>;
    fn get(&self, name: &str) -> Result<String>;
}

pub const STUB_VALUE: &str = "Goodbye Universe";

/// Accepts every `set` and answers every `get` with [`STUB_VALUE`].
#[derive(Debug, Clone, Copy, Default)]
pub struct StubProperties;

impl Properties for StubProperties {
    fn set(&self, name: &str, value: &str) -> Result<()> {
        log::trace!("set {name:?} = {value:?}");
        Ok(())
    }

    fn get(&self, name: &str) -> Result<String> {
        log::trace!("get {name:?}");
        Ok(STUB_VALUE.to_string())
    }
}
