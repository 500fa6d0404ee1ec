use std::{ops::Deref, sync::Arc};

use crate::config::BotConfig;
use crate::tickets::TicketService;

/// User data shared with every command and event handler
#[derive(Clone)]
pub struct Data(pub Arc<DataInner>);

impl std::fmt::Debug for Data {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Data")
            .field("config", &self.0.config)
            .field("service", &self.0.service)
            .finish()
    }
}

impl Deref for Data {
    type Target = DataInner;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Data {
    #[must_use]
    pub fn new(config: BotConfig, service: Arc<TicketService>) -> Self {
        Self(Arc::new(DataInner { config, service }))
    }

    /// The ticket service
    #[must_use]
    pub fn tickets(&self) -> &TicketService {
        &self.0.service
    }
}

/// Main centralized data structure for the bot
pub struct DataInner {
    pub config: BotConfig,
    pub service: Arc<TicketService>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::MockPlatform;
    use crate::tickets::{MemoryStorage, ServiceSettings};

    #[test]
    fn test_data_shares_service() {
        let service = TicketService::new(
            Arc::new(MemoryStorage::new()),
            Arc::new(MockPlatform::new()),
            ServiceSettings::default(),
        );
        let data = Data::new(BotConfig::default(), Arc::clone(&service));
        let copy = data.clone();
        assert!(std::ptr::eq(copy.tickets(), data.tickets()));
        assert_eq!(copy.config.prefix, "!");
        assert!(format!("{data:?}").contains("Data"));
    }
}
