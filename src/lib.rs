pub mod clock;
pub mod config;
pub mod controllers;
pub mod error;
pub mod middleware;
pub mod models;
pub mod redis_client;
pub mod services;
pub mod store;
pub mod tasks;
pub mod token;

#[cfg(any(test, feature = "test-utils"))]
pub mod mocks;

use axum::{routing::get, Router};
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::clock::Clock;
use crate::services::{
    booking::{BookingSaga, SagaConfig},
    checkin::CheckinValidator,
    identity::{IdentityProvider, JwtVerifier},
    notify::Notifier,
    payment::PaymentGateway,
    pricing::PricingEngine,
    seats::SeatReservations,
};
use crate::store::{DataStore, Store};
use crate::tasks::{TaskDistributor, TaskProcessor};
use crate::token::TokenCodec;

/// Внешние зависимости ядра. В проде HTTP/Redis-клиенты, в тестах `mocks`.
pub struct Services {
    pub store: Arc<dyn DataStore>,
    pub gateway: Arc<dyn PaymentGateway>,
    pub distributor: Arc<dyn TaskDistributor>,
    pub identity: Arc<dyn IdentityProvider>,
    pub notifier: Arc<dyn Notifier>,
    pub clock: Arc<dyn Clock>,
}

// Shared state для всего приложения
#[derive(Clone)]
pub struct AppState {
    pub config: config::Config,
    pub store: Store,
    pub saga: Arc<BookingSaga>,
    pub checkins: Arc<CheckinValidator>,
    pub processor: Arc<TaskProcessor>,
    pub verifier: JwtVerifier,
}

impl AppState {
    pub fn new(config: config::Config, services: Services) -> Arc<Self> {
        let store = Store::new(services.store);
        let codec = TokenCodec::new(&config.ticket.secret_key);
        let pricing = PricingEngine::new(store.clone(), config.pricing.points_unit, services.clock.clone());

        let saga = Arc::new(BookingSaga::new(
            store.clone(),
            services.gateway,
            SeatReservations::new(store.clone()),
            pricing.clone(),
            services.distributor,
            codec.clone(),
            services.clock.clone(),
            SagaConfig::from_config(&config),
        ));
        let checkins = Arc::new(CheckinValidator::new(
            store.clone(),
            services.identity,
            codec,
            services.clock,
            config.jwt.staff_role.clone(),
        ));
        let processor = Arc::new(TaskProcessor::new(saga.clone(), pricing, services.notifier));
        let verifier = JwtVerifier::new(&config.jwt);

        Arc::new(Self {
            config,
            store,
            saga,
            checkins,
            processor,
            verifier,
        })
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(|| async { "Box Office API v1.0" }))
        .route("/health", get(|| async { "OK" }))
        .nest("/api", controllers::routes())
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}
