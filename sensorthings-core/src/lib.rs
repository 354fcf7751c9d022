mod backoff;
mod client;

pub use backoff::{Backoff, RetryPolicy};
pub use client::{
    ApiErrorClass, ClientConfig, Datastream, EntityRef, FeatureOfInterest, ListResponse,
    Observation, ObservationQuery, SensorThingsClient, SensorThingsError, Thing, TimeOrder,
    UnitOfMeasurement,
};
