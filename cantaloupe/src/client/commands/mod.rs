pub use self::publish::{ClientPublish, DoClientPublish, Publish, PublishBuilder};
pub use self::request::{
    ClientRequest, DoClientRequest, Request, RequestBuilder, ResponseError, ResponseFut,
};

mod publish;
mod request;
