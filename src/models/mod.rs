mod media;
mod subscription;

pub use media::{HashType, MediaHash, MediaRef, Mediated, Metadata};
pub use subscription::{Draft, FeedId, Header, Subscription, SubscriptionValue};
