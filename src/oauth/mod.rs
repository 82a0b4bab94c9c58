//! OAuth 2.0 authorization-code flow.
//!
//! One broker drives all three provider dialects:
//! 1. `GET /auth/:provider/authorize` → authorize URL with a sealed
//!    state parameter
//! 2. User consents on the provider's site
//! 3. Provider redirects to `/auth/:provider/callback`
//! 4. Broker validates the state, exchanges the code for tokens
//! 5. IntegrationManager stores the tokens encrypted and marks the
//!    integration connected
//!
//! The in-flight authorization state machine (INIT → URL issued → code
//! received → exchanged/failed) is ephemeral: it lives in the sealed
//! state parameter and the request flow, never in a server-side table.

mod broker;
mod state;

pub use broker::{AuthorizeUrl, OAuthBroker, TokenGrant};
pub use state::{StateClaims, StateSealer};
