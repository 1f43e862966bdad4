//! Zentinel gRPC Mock
//!
//! A gRPC mock engine: matches incoming calls against declared stubs and
//! replays scripted responses for unary, client-streaming, server-streaming
//! and bidirectional calls.
//!
//! # Features
//!
//! - **Input Matching**: `equals`, `contains`, `matches` (regex) and `any`,
//!   with optional order-insensitive arrays
//! - **Streaming Scripts**: ordered `send`, `delay` and `end` steps
//! - **Dynamic Templates**: Handlebars templates over the request, headers and
//!   message index
//! - **Usage Limits**: stop answering after `times` successful calls
//! - **Diagnostics**: closest-stub ranking when nothing matches
//! - **History**: bounded in-memory record of served calls
//!
//! # Example Configuration
//!
//! ```yaml
//! stubs:
//!   - id: hello
//!     service: helloworld.Greeter
//!     method: SayHello
//!     input:
//!       equals:
//!         name: Bob
//!     outputs:
//!       - stream:
//!           - send: {message: "Hello, {{request.name}}"}
//!           - delay: 50ms
//!           - end: {code: OK}
//! ```

pub mod analytics;
pub mod config;
pub mod executor;
pub mod matcher;
pub mod ranker;
pub mod server;
pub mod store;
pub mod template;

pub use config::{Matcher, Metadata, MockConfig, Payload, RpcShape, Status, Stub};
pub use executor::{
    Aborted, CallContext, ExecuteError, Execution, Executor, ResponseWriter, RuntimeHook,
    TransportError,
};
pub use server::{Call, CallOutcome, MockServer, ServeError};
pub use template::{Renderer, TemplateEngine};
