pub use cantaloupe_proto as proto;

mod client;
mod handler;
pub mod jetstream;
mod multiplexed_subscription;
mod subscription;
#[cfg(test)]
pub(crate) mod tests;

pub mod core {
    //! NATS Core functionality implementation

    pub use crate::client::{
        Authentication, Client, ClientBuilder, ClientError, ClientEvent, ClientStatus, Echo,
    };
    pub(crate) use crate::multiplexed_subscription::MultiplexedSubscription;
    pub use crate::subscription::{Subscription, SubscriptionStats};

    pub mod publish {
        //! Utilities for publishing messages

        pub use crate::client::{ClientPublish, DoClientPublish, Publish, PublishBuilder};
    }

    pub mod request {
        //! Utilities for publishing requests and awaiting their response

        pub use crate::client::{ClientRequest, DoClientRequest, Request, RequestBuilder, ResponseFut};
    }

    pub mod error {
        //! NATS Core specific errors

        pub use crate::client::{
            AttemptError, ClientClosedError, ConnectError, DrainError, FlushError, PublishError,
            ResponseError, TryCommandError,
        };
        pub use crate::subscription::NextMessageError;
    }
}
