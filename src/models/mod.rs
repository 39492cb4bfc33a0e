pub mod booking;
pub mod checkin;
pub mod membership;
pub mod payment;
pub mod seat;
pub mod settings;
pub mod ticket;

pub use booking::{Booking, BookingItem, BookingItemStatus, BookingStatus};
pub use checkin::Checkin;
pub use membership::{LedgerSource, Membership, PointLedgerEntry};
pub use payment::{Payment, PaymentStatus, Refund, RefundReason, RefundStatus};
pub use seat::{Seat, SeatStatus};
pub use settings::Settings;
pub use ticket::{EventSchedule, Ticket};
