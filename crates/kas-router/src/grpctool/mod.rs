//! gRPC plumbing shared by the router: raw frame codec, stream visitor,
//! runtime service descriptors and call contexts.

pub mod context;
pub mod descriptor;
pub mod max_conn_age;
pub mod metadata;
pub mod raw_codec;
pub mod registrar;
pub mod retry;
pub mod stream_visitor;

pub use context::{ContextError, RequestContext, status_from_context_error};
pub use descriptor::{FrameStream, FullMethod, ServiceDesc, StreamHandler, munge_descriptor};
pub use max_conn_age::MaxConnAge;
pub use raw_codec::{RawCodec, RawFrame};
pub use registrar::{RegistrarError, RoutesRegistrar, ServiceRegistrar};
pub use retry::{PollError, Poller, poll_immediate_until};
pub use stream_visitor::{StreamVisitor, VisitError, VisitHandler, VisitOptions};
