use std::sync::Mutex;

use async_trait::async_trait;

use crate::midi::registry::model::LoadError;
use crate::midi::registry::source::PumpSource;

/// Pump table held in memory; contents can be swapped between loads.
pub struct InMemorySource {
    contents: Mutex<String>,
    reads: Mutex<usize>,
}

impl InMemorySource {
    pub fn new<S: Into<String>>(contents: S) -> InMemorySource {
        InMemorySource {
            contents: Mutex::new(contents.into()),
            reads: Mutex::new(0),
        }
    }

    pub fn replace<S: Into<String>>(&self, contents: S) {
        if let Ok(mut current) = self.contents.lock() {
            *current = contents.into();
        }
    }

    pub fn reads(&self) -> usize {
        self.reads.lock().map(|r| *r).unwrap_or_default()
    }
}

#[async_trait]
impl PumpSource for InMemorySource {
    async fn read(&self) -> Result<String, LoadError> {
        if let Ok(mut reads) = self.reads.lock() {
            *reads += 1;
        }
        Ok(self
            .contents
            .lock()
            .map(|c| c.clone())
            .unwrap_or_default())
    }

    fn describe(&self) -> String {
        "in-memory pump table".to_string()
    }
}
