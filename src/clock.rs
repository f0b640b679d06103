use std::time::SystemTime;
use crate::feature::{Clock, Feature};

pub struct SystemClock;

#[async_trait::async_trait]
impl Feature for SystemClock {
    async fn start(&self) -> crate::Result<()> {
        Ok(())
    }

    async fn close(&self) -> crate::Result<()> {
        Ok(())
    }
}

impl Clock for SystemClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }
}
