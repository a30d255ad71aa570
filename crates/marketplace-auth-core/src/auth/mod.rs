mod backend;
mod clock;
mod credential_store;
mod error;
mod orchestrator;
mod provider;
mod record;
mod redirect;
mod refresh;
mod session;
mod signout;
mod validator;

pub use backend::{BackendClient, ProbeOutcome};
pub use clock::{Clock, ManualClock, SystemClock};
pub use credential_store::{CredentialStore, HttpKvStore, KvStore, MemoryKvStore};
pub use error::{AuthError, RefreshError, StoreError};
pub use orchestrator::{AuthManager, Collaborators};
pub use provider::{InvalidProvider, Provider, ProviderSelector, PROVIDER_KEY};
pub use record::{AuthRecord, RecordDecodeError, RecordLookup, TokenPair};
pub use redirect::{
    is_destination, redirect_location, LogNavigator, Navigator, RedirectDecision, RedirectEngine,
    RedirectReason, RedirectTarget, RedirectThrottle, SuppressReason,
};
pub use refresh::{RefreshCoordinator, RefreshResult, RetryPolicy};
pub use session::{HttpOuterSession, OuterSession};
pub use signout::{
    EphemeralStorage, InvalidationSignal, MemoryEphemeralStorage, PurgeScope, SignoutOrchestrator,
    SignoutReport, SignoutStep, StepOutcome,
};
pub use validator::{
    transition, ProbePolicy, SessionValidator, ValidationEvent, ValidationResult, ValidationState,
};
