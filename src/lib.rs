#![deny(rust_2018_idioms)]

mod clock;
mod cluster;
mod config;
mod dispatcher;
mod error;
mod inhibit;
mod marker;
mod matcher;
mod metrics;
mod nflog;
mod pipeline;
mod provider;
mod receiver;
mod route;
mod silence;
mod types;

pub use clock::{Clock, FakeClock, SharedClock, SystemClock};
pub use cluster::{Cluster, ClusterConfig, GossipedComponent, NflogChannel, SilencesChannel, TlsMaterial, TransportConfig};
pub use config::{ClusterSection, Config, ReceiverConfig, StoreSection, TlsSection};
pub use dispatcher::Dispatcher;
pub use error::{ClusterError, IngestError, LogError, NflogError, PipelineError, RouteError, SilenceError};
pub use inhibit::{InhibitRuleConfig, Inhibitor};
pub use marker::{Marker, MarkerState, MarkerStore};
pub use matcher::{MatchOp, Matcher};
pub use metrics::{gather_metrics, init_metrics};
pub use nflog::{NflogEntry, NflogKey, NotificationLog};
pub use pipeline::{ClusterView, PipelineAlert, PipelineContext, RetryPolicy, SingleNodeCluster};
pub use provider::{AlertProvider, AlertSubscription};
pub use receiver::{NullReceiver, Receiver, RecordingReceiver, SendError};
pub use route::{GroupBy, Route, RouteConfig, RouteTree};
pub use silence::{MeshSilence, Silence, SilenceLimits, SilenceState, Silences};
pub use types::{Alert, Annotations, Fingerprint, GroupKey, LabelSet};
