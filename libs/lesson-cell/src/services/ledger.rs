use tracing::{debug, warn};

use crate::models::{Booking, CourseRegistration, RegistrationWrite};

/// The only code that changes `lessons_left`.
///
/// A debit marks the booking as charged; a credit only ever returns a charge
/// that booking holds, so every reverse transition restores exactly what its
/// forward transition took and the balance never goes negative.
pub struct CreditLedger {
    registration: CourseRegistration,
    opening_balance: i64,
}

impl CreditLedger {
    pub fn open(registration: CourseRegistration) -> Self {
        let opening_balance = registration.lessons_left;
        Self {
            registration,
            opening_balance,
        }
    }

    pub fn balance(&self) -> i64 {
        self.registration.lessons_left
    }

    pub fn registration(&self) -> &CourseRegistration {
        &self.registration
    }

    /// Take one lesson for `booking`. Returns whether credit moved.
    pub fn debit(&mut self, booking: &mut Booking) -> bool {
        if booking.charged {
            debug!("Booking {} already charged", booking.code);
            return false;
        }
        if self.registration.lessons_left <= 0 {
            warn!(
                "Registration {} has no lessons left, booking {} not charged",
                self.registration.uuid, booking.code
            );
            return false;
        }

        self.registration.lessons_left -= 1;
        booking.charged = true;
        true
    }

    /// Return the lesson `booking` holds, if any.
    pub fn credit(&mut self, booking: &mut Booking) -> bool {
        if !booking.charged {
            debug!("Booking {} holds no charge to return", booking.code);
            return false;
        }

        self.registration.lessons_left += 1;
        booking.charged = false;
        true
    }

    /// The compare-and-set write for the store, if the balance moved.
    pub fn into_write(self) -> Option<RegistrationWrite> {
        if self.registration.lessons_left == self.opening_balance {
            return None;
        }
        Some(RegistrationWrite {
            uuid: self.registration.uuid,
            expected_lessons_left: self.opening_balance,
            lessons_left: self.registration.lessons_left,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, Utc};
    use uuid::Uuid;

    use crate::models::{BookingParty, BookingStatus, PaymentStatus};

    fn registration(lessons_left: i64) -> CourseRegistration {
        CourseRegistration {
            uuid: Uuid::new_v4(),
            student_id: Uuid::new_v4(),
            course_id: Uuid::new_v4(),
            teacher_id: None,
            registered_date: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            lessons_left,
            exp_date: None,
            payment_status: PaymentStatus::Confirm,
        }
    }

    fn booking(registration: &CourseRegistration) -> Booking {
        Booking {
            id: Uuid::new_v4(),
            code: "bookingcode1".to_string(),
            lesson_id: Uuid::new_v4(),
            party: BookingParty::Student {
                student_id: registration.student_id,
                registration_uuid: registration.uuid,
            },
            status: BookingStatus::Completed,
            check_in: None,
            check_out: None,
            missed: false,
            charged: false,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn debit_then_credit_conserves_balance() {
        let reg = registration(3);
        let mut b = booking(&reg);
        let mut ledger = CreditLedger::open(reg);

        assert!(ledger.debit(&mut b));
        assert_eq!(ledger.balance(), 2);
        assert!(ledger.credit(&mut b));
        assert_eq!(ledger.balance(), 3);
        assert!(ledger.into_write().is_none());
    }

    #[test]
    fn debit_clamps_at_zero() {
        let reg = registration(0);
        let mut b = booking(&reg);
        let mut ledger = CreditLedger::open(reg);

        assert!(!ledger.debit(&mut b));
        assert!(!b.charged);
        // Nothing was taken, so nothing comes back.
        assert!(!ledger.credit(&mut b));
        assert_eq!(ledger.balance(), 0);
    }

    #[test]
    fn double_debit_charges_once() {
        let reg = registration(2);
        let mut b = booking(&reg);
        let mut ledger = CreditLedger::open(reg);

        assert!(ledger.debit(&mut b));
        assert!(!ledger.debit(&mut b));

        let write = ledger.into_write().unwrap();
        assert_eq!(write.expected_lessons_left, 2);
        assert_eq!(write.lessons_left, 1);
    }
}
