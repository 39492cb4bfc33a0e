pub mod booking;
pub mod checkin;
pub mod cleanup;
pub mod identity;
pub mod notify;
pub mod payment;
pub mod pricing;
pub mod seats;
