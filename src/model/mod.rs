//! Shared entities: events, master data, capture requests, queries, subscriptions
//!
//! The model carries no storage or scheduling behavior. Events and master
//! data are immutable once committed; only subscription bookkeeping changes.

pub mod event;
pub mod masterdata;
pub mod query;
pub mod request;
pub mod subscription;

pub use event::{
    BusinessTransaction, CustomField, Epc, EpcType, ErrorDeclaration, Event, EventAction, EventId,
    EventType, FieldType, SourceDestination, SourceDestinationDirection,
};
pub use masterdata::{MasterData, MasterDataAttribute, BUSINESS_LOCATION_TYPE, READ_POINT_TYPE};
pub use query::{normalize_parameters, Poll, PollResponse, QueryParameter, QueryResults};
pub use request::{
    CallbackType, CaptureRequest, ContactInformation, ContactRole, RequestContext,
    StandardBusinessHeader, SubscriptionCallback,
};
pub use subscription::{QuerySchedule, ScheduleField, ScheduleParseError, Subscription, SubscriptionTrigger};
