//! Inventory hold/release driven by payment outcomes.
//!
//! The release marker lives on the payment row and is written in the same
//! unit of work as the capacity change, so a booking's seats go back at
//! most once however often the failure is delivered.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::domain::{Booking, EventInventory, ReleaseMarker, Transaction};
use crate::error::PipelineError;
use crate::ports::{RepositoryResult, UnitOfWork};

pub struct ReservationCoordinator;

impl ReservationCoordinator {
    /// Takes `quantity` seats for a new booking.
    pub async fn hold(
        unit: &mut dyn UnitOfWork,
        event_id: Uuid,
        quantity: i32,
    ) -> Result<EventInventory, PipelineError> {
        let mut inventory = unit
            .inventory(event_id)
            .await?
            .ok_or_else(|| PipelineError::NotFound(format!("inventory for event {}", event_id)))?;

        if !inventory.hold(quantity) {
            return Err(PipelineError::SoldOut(format!(
                "event {} has {} seats left, {} requested",
                event_id, inventory.available, quantity
            )));
        }
        unit.save_inventory(&inventory).await?;
        Ok(inventory)
    }

    /// Gives the booking's seats back unless this payment already did.
    /// Returns the number of seats actually released.
    pub async fn release_if_not_already(
        unit: &mut dyn UnitOfWork,
        payment: &mut Transaction,
        booking: &Booking,
        now: DateTime<Utc>,
    ) -> RepositoryResult<i32> {
        if payment.markers.release.tickets_released {
            tracing::debug!(
                payment_id = %payment.id,
                booking_id = %booking.id,
                "Seats already released for this payment"
            );
            return Ok(0);
        }

        let released = match unit.inventory(booking.event_id).await? {
            Some(mut inventory) => {
                let released = inventory.release(booking.quantity);
                unit.save_inventory(&inventory).await?;
                released
            }
            None => {
                tracing::warn!(event_id = %booking.event_id, "No inventory row to release into");
                0
            }
        };

        payment.markers.release = ReleaseMarker {
            tickets_released: true,
            released_quantity: Some(released),
            released_at: Some(now),
            reinstated_at: None,
        };
        payment.updated_at = now;
        unit.update_transaction(payment).await?;

        tracing::info!(
            booking_id = %booking.id,
            event_id = %booking.event_id,
            released,
            "Released reserved seats"
        );
        Ok(released)
    }

    /// Takes back seats a late success finds already released. Capacity
    /// sold to someone else in between is not reclaimed.
    pub async fn reinstate(
        unit: &mut dyn UnitOfWork,
        payment: &mut Transaction,
        booking: &Booking,
        now: DateTime<Utc>,
    ) -> RepositoryResult<bool> {
        if !payment.markers.release.tickets_released {
            return Ok(false);
        }

        let quantity = payment
            .markers
            .release
            .released_quantity
            .unwrap_or(booking.quantity);

        if let Some(mut inventory) = unit.inventory(booking.event_id).await? {
            if inventory.hold(quantity) {
                unit.save_inventory(&inventory).await?;
            } else if quantity > 0 {
                tracing::warn!(
                    booking_id = %booking.id,
                    event_id = %booking.event_id,
                    quantity,
                    available = inventory.available,
                    "Late payment confirmed a booking whose seats were resold"
                );
            }
        }

        payment.markers.release.tickets_released = false;
        payment.markers.release.reinstated_at = Some(now);
        payment.updated_at = now;
        unit.update_transaction(payment).await?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::MemoryStore;
    use crate::domain::{BookingStatus, TransactionType};
    use crate::ports::LedgerStore;
    use bigdecimal::BigDecimal;

    async fn fixture(available: i32) -> (MemoryStore, Transaction, Booking) {
        let store = MemoryStore::new();
        let event_id = Uuid::new_v4();
        let now = Utc::now();
        let booking = Booking {
            id: Uuid::new_v4(),
            user_id: "user_1".to_string(),
            host_id: "host_1".to_string(),
            experience_id: Uuid::new_v4(),
            event_id,
            quantity: 2,
            total_amount: BigDecimal::from(100),
            currency: "usd".to_string(),
            status: BookingStatus::Pending,
            payment_intent_id: Some("pi_1".to_string()),
            created_at: now,
            updated_at: now,
        };
        let mut payment = Transaction::new(
            TransactionType::BookingPayment,
            BigDecimal::from(100),
            "usd".to_string(),
        );
        payment.booking_id = Some(booking.id);

        store.seed_booking(booking.clone()).await;
        store.seed_transaction(payment.clone()).await;
        store
            .seed_inventory(EventInventory {
                event_id,
                capacity: 10,
                available,
            })
            .await;
        (store, payment, booking)
    }

    #[tokio::test]
    async fn test_release_happens_once() {
        let (store, mut payment, booking) = fixture(8).await;

        for expected in [2, 0] {
            let mut unit = store.begin().await.unwrap();
            let released = ReservationCoordinator::release_if_not_already(
                unit.as_mut(),
                &mut payment,
                &booking,
                Utc::now(),
            )
            .await
            .unwrap();
            unit.commit().await.unwrap();
            assert_eq!(released, expected);
        }

        assert_eq!(store.inventory(booking.event_id).await.unwrap().available, 10);
        let stored = store.transaction(payment.id).await.unwrap();
        assert!(stored.markers.release.tickets_released);
    }

    #[tokio::test]
    async fn test_hold_refuses_oversell() {
        let (store, _, booking) = fixture(1).await;
        let mut unit = store.begin().await.unwrap();
        let result = ReservationCoordinator::hold(unit.as_mut(), booking.event_id, 2).await;
        assert!(matches!(result, Err(PipelineError::SoldOut(_))));
    }

    #[tokio::test]
    async fn test_reinstate_clears_marker() {
        let (store, mut payment, booking) = fixture(8).await;
        let mut unit = store.begin().await.unwrap();
        ReservationCoordinator::release_if_not_already(
            unit.as_mut(),
            &mut payment,
            &booking,
            Utc::now(),
        )
        .await
        .unwrap();
        assert!(ReservationCoordinator::reinstate(unit.as_mut(), &mut payment, &booking, Utc::now())
            .await
            .unwrap());
        unit.commit().await.unwrap();

        assert_eq!(store.inventory(booking.event_id).await.unwrap().available, 8);
        let stored = store.transaction(payment.id).await.unwrap();
        assert!(!stored.markers.release.tickets_released);
        assert!(stored.markers.release.reinstated_at.is_some());
    }
}
