pub mod dispatcher;
pub mod format;
pub mod store;

pub use dispatcher::{
    CycleReport, DeliveryReport, Dispatcher, HttpMediaProbe, MediaProbe, MessageSender,
    PopularSubscribeOutcome,
};
pub use format::{DeliveryMode, OutboundMessage};
pub use store::{
    FileKvStore, KvStore, MemoryKvStore, PopularScale, PopularSubscription, SubscriptionGroup,
    SubscriptionStore, TagSubscription,
};
