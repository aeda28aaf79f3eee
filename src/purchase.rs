//! Marketplace Purchase
//! Mission: charge a buyer and open an escrow hold, at most once per ticket
//!
//! The debit, the hold, the purchase record and the listing counter all
//! share one SQLite transaction: any failure before commit rolls the lot
//! back and the buyer is never out of pocket. A lost race on the hold's
//! unique index is the one exception that still commits, carrying a
//! compensating credit so the debit/refund pair stays on the ledger.

use crate::models::{round2, Ticket};
use crate::notify::{Notification, NotificationSink};
use crate::store::{is_unique_violation, ticket_in, SettlementStore};
use crate::wallet::{LedgerError, WalletLedger};
use rusqlite::params;
use std::fmt;
use tracing::{error, info, warn};

#[derive(Debug)]
pub enum PurchaseError {
    TicketNotFound,
    TicketNotActive,
    AlreadySettled,
    AlreadyPurchased,
    NotListed,
    InsufficientBalance { balance: f64, price: f64 },
    Storage(anyhow::Error),
}

impl fmt::Display for PurchaseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PurchaseError::TicketNotFound => write!(f, "ticket not found"),
            PurchaseError::TicketNotActive => write!(f, "ticket is not active"),
            PurchaseError::AlreadySettled => write!(f, "ticket has already been settled"),
            PurchaseError::AlreadyPurchased => write!(f, "ticket already purchased by this user"),
            PurchaseError::NotListed => write!(f, "ticket has no active marketplace listing"),
            PurchaseError::InsufficientBalance { balance, price } => write!(
                f,
                "insufficient balance: have {:.2}, ticket costs {:.2}",
                balance, price
            ),
            PurchaseError::Storage(e) => write!(f, "purchase storage error: {}", e),
        }
    }
}

impl std::error::Error for PurchaseError {}

impl From<rusqlite::Error> for PurchaseError {
    fn from(e: rusqlite::Error) -> Self {
        PurchaseError::Storage(e.into())
    }
}

impl From<anyhow::Error> for PurchaseError {
    fn from(e: anyhow::Error) -> Self {
        PurchaseError::Storage(e)
    }
}

pub struct MarketplaceService {
    store: SettlementStore,
    wallet: WalletLedger,
    notifier: Box<dyn NotificationSink>,
}

impl MarketplaceService {
    pub fn new(
        store: SettlementStore,
        wallet: WalletLedger,
        notifier: Box<dyn NotificationSink>,
    ) -> Self {
        Self {
            store,
            wallet,
            notifier,
        }
    }

    pub fn store(&self) -> &SettlementStore {
        &self.store
    }

    pub fn wallet(&self) -> &WalletLedger {
        &self.wallet
    }

    /// Buy a listed ticket. Debits the buyer, opens the escrow hold and
    /// records the purchase; duplicate concurrent calls leave exactly one
    /// hold and one net debit behind.
    pub fn purchase(&self, buyer_id: i64, ticket_id: i64) -> Result<Ticket, PurchaseError> {
        let mut conn = self.store.open().map_err(PurchaseError::Storage)?;
        let tx = conn.transaction()?;

        let ticket = ticket_in(&tx, ticket_id)
            .map_err(PurchaseError::Storage)?
            .ok_or(PurchaseError::TicketNotFound)?;
        if ticket.result.is_settled() {
            return Err(PurchaseError::AlreadySettled);
        }
        if !ticket.is_marketplace || ticket.status != "active" {
            return Err(PurchaseError::TicketNotActive);
        }
        if self.store.has_purchase_in(&tx, buyer_id, ticket_id)? {
            return Err(PurchaseError::AlreadyPurchased);
        }
        let listing = self
            .store
            .active_listing_in(&tx, ticket_id)?
            .ok_or(PurchaseError::NotListed)?;
        let price = round2(listing.price);

        // Everything below shares this transaction. An early return drops
        // the transaction, so a ledger failure rolls the debit back with
        // everything else and nothing is committed.
        let reference = format!("ticket-{}", ticket_id);
        if price > 0.0 {
            match self.wallet.debit_in(
                &tx,
                buyer_id,
                price,
                "purchase",
                &reference,
                &format!("Purchase of ticket \"{}\"", ticket.title),
            ) {
                Ok(()) => {}
                Err(LedgerError::InsufficientBalance { balance, .. }) => {
                    return Err(PurchaseError::InsufficientBalance { balance, price });
                }
                // A debit journal row already exists for this (buyer, ticket):
                // a previous purchase went through.
                Err(LedgerError::DuplicateReference { .. }) => {
                    return Err(PurchaseError::AlreadyPurchased);
                }
                Err(LedgerError::Storage(e)) => return Err(PurchaseError::Storage(e)),
            }
        }

        let hold_id = match self
            .store
            .create_escrow_in(&tx, buyer_id, ticket_id, price, &reference)
        {
            Ok(id) => id,
            Err(e) if is_unique_violation(&e) => {
                warn!(buyer_id, ticket_id, "Concurrent duplicate purchase (hold)");
                return self.compensate_and_close(tx, buyer_id, price, ticket_id, None);
            }
            Err(e) => return Err(e.into()),
        };
        if let Err(e) = self.store.insert_purchase_in(&tx, buyer_id, ticket_id, price) {
            if is_unique_violation(&e) {
                warn!(buyer_id, ticket_id, "Concurrent duplicate purchase (record)");
                return self.compensate_and_close(tx, buyer_id, price, ticket_id, Some(hold_id));
            }
            return Err(e.into());
        }
        self.store.increment_purchase_count_in(&tx, ticket_id)?;
        tx.commit()?;

        info!(buyer_id, ticket_id, price, "Ticket purchased");
        metrics::counter!("marketplace_purchases", 1);
        self.notifier.notify(
            ticket.user_id,
            Notification::new(
                "ticket_purchased",
                "Your ticket sold",
                &format!("\"{}\" was purchased for {:.2}", ticket.title, price),
                Some(format!("/tickets/{}", ticket_id)),
            ),
        );

        self.store
            .ticket(ticket_id)
            .map_err(PurchaseError::Storage)?
            .ok_or(PurchaseError::TicketNotFound)
    }

    /// Close out a purchase that lost a duplicate race: discard any hold
    /// this call created, reverse the debit with a compensating credit in
    /// the same transaction, and commit so the debit/refund pair stays on
    /// the ledger as an audit trail. Always surfaces `AlreadyPurchased`.
    fn compensate_and_close(
        &self,
        tx: rusqlite::Transaction<'_>,
        buyer_id: i64,
        price: f64,
        ticket_id: i64,
        hold_id: Option<i64>,
    ) -> Result<Ticket, PurchaseError> {
        if let Some(id) = hold_id {
            tx.execute("DELETE FROM escrow_holds WHERE id = ?1", params![id])?;
        }
        if price > 0.0 {
            let reference = format!("ticket-{}-refund", ticket_id);
            if let Err(e) = self.wallet.credit_in(
                &tx,
                buyer_id,
                price,
                "refund",
                &reference,
                &format!("Reversal of duplicate purchase of ticket {}", ticket_id),
            ) {
                // Dropping the transaction rolls the debit back too, so the
                // buyer's balance stays consistent either way.
                error!(
                    buyer_id,
                    ticket_id,
                    price,
                    error = %e,
                    "Compensating refund failed, rolling back purchase"
                );
                return Err(PurchaseError::Storage(anyhow::anyhow!(
                    "compensating refund failed for user {} ticket {}: {}",
                    buyer_id,
                    ticket_id,
                    e
                )));
            }
            info!(buyer_id, ticket_id, price, "Compensating refund issued");
        }
        tx.commit()?;
        Err(PurchaseError::AlreadyPurchased)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EscrowStatus, MatchKind, ResultStatus};
    use crate::notify::LogNotifier;
    use crate::store::NewLeg;
    use chrono::Utc;
    use tempfile::NamedTempFile;

    fn service() -> (MarketplaceService, NamedTempFile) {
        let temp = NamedTempFile::new().unwrap();
        let path = temp.path().to_str().unwrap();
        let store = SettlementStore::new(path).unwrap();
        let wallet = WalletLedger::new(path).unwrap();
        (
            MarketplaceService::new(store, wallet, Box::new(LogNotifier)),
            temp,
        )
    }

    fn listed_ticket(svc: &MarketplaceService, seller_id: i64, price: f64) -> Ticket {
        let legs = vec![NewLeg {
            match_id: 1,
            match_kind: MatchKind::Fixture,
            prediction: "home".to_string(),
            odds: 1.8,
            match_date: Some(Utc::now()),
        }];
        let ticket = svc
            .store()
            .create_ticket(seller_id, "Saturday banker", price, true, &legs)
            .unwrap();
        svc.store().create_listing(ticket.id, price).unwrap();
        ticket
    }

    #[test]
    fn test_purchase_debits_and_opens_hold() {
        let (svc, _temp) = service();
        let ticket = listed_ticket(&svc, 1, 30.0);
        svc.wallet().credit(2, 100.0, "deposit", "dep-1", "Deposit").unwrap();

        svc.purchase(2, ticket.id).unwrap();

        assert_eq!(svc.wallet().balance(2).unwrap(), 70.0);
        let holds = svc.store().escrows_for_ticket(ticket.id).unwrap();
        assert_eq!(holds.len(), 1);
        assert_eq!(holds[0].user_id, 2);
        assert_eq!(holds[0].amount, 30.0);
        assert_eq!(holds[0].status, EscrowStatus::Held);
        assert_eq!(
            svc.store().listing(ticket.id).unwrap().unwrap().purchase_count,
            1
        );
    }

    #[test]
    fn test_purchase_rejects_unknown_ticket() {
        let (svc, _temp) = service();
        assert!(matches!(
            svc.purchase(2, 999).unwrap_err(),
            PurchaseError::TicketNotFound
        ));
    }

    #[test]
    fn test_purchase_rejects_settled_ticket() {
        let (svc, _temp) = service();
        let ticket = listed_ticket(&svc, 1, 30.0);
        svc.store().settle_ticket(ticket.id, ResultStatus::Won).unwrap();

        assert!(matches!(
            svc.purchase(2, ticket.id).unwrap_err(),
            PurchaseError::AlreadySettled
        ));
    }

    #[test]
    fn test_purchase_rejects_inactive_ticket() {
        let (svc, _temp) = service();
        let ticket = listed_ticket(&svc, 1, 30.0);
        let conn = svc.store().open().unwrap();
        conn.execute(
            "UPDATE tickets SET status = 'paused' WHERE id = ?1",
            rusqlite::params![ticket.id],
        )
        .unwrap();

        assert!(matches!(
            svc.purchase(2, ticket.id).unwrap_err(),
            PurchaseError::TicketNotActive
        ));
    }

    #[test]
    fn test_purchase_rejects_unlisted_ticket() {
        let (svc, _temp) = service();
        let legs = vec![NewLeg {
            match_id: 1,
            match_kind: MatchKind::Fixture,
            prediction: "home".to_string(),
            odds: 1.8,
            match_date: Some(Utc::now()),
        }];
        let ticket = svc
            .store()
            .create_ticket(1, "unlisted", 30.0, true, &legs)
            .unwrap();

        assert!(matches!(
            svc.purchase(2, ticket.id).unwrap_err(),
            PurchaseError::NotListed
        ));
    }

    #[test]
    fn test_purchase_rejects_insufficient_balance() {
        let (svc, _temp) = service();
        let ticket = listed_ticket(&svc, 1, 30.0);
        svc.wallet().credit(2, 10.0, "deposit", "dep-1", "Deposit").unwrap();

        let err = svc.purchase(2, ticket.id).unwrap_err();
        assert!(matches!(
            err,
            PurchaseError::InsufficientBalance { balance, price }
                if balance == 10.0 && price == 30.0
        ));
        assert_eq!(svc.wallet().balance(2).unwrap(), 10.0);
        assert!(svc.store().escrows_for_ticket(ticket.id).unwrap().is_empty());
        // The whole transaction rolled back: no debit journal row either
        let txs = svc.wallet().transactions(2, 10).unwrap();
        assert!(txs.iter().all(|t| t.kind == "deposit"));
    }

    #[test]
    fn test_second_purchase_rejected() {
        let (svc, _temp) = service();
        let ticket = listed_ticket(&svc, 1, 30.0);
        svc.wallet().credit(2, 100.0, "deposit", "dep-1", "Deposit").unwrap();

        svc.purchase(2, ticket.id).unwrap();
        assert!(matches!(
            svc.purchase(2, ticket.id).unwrap_err(),
            PurchaseError::AlreadyPurchased
        ));
        assert_eq!(svc.wallet().balance(2).unwrap(), 70.0);
    }

    #[test]
    fn test_lost_race_refunds_the_debit() {
        let (svc, _temp) = service();
        let ticket = listed_ticket(&svc, 1, 30.0);
        svc.wallet().credit(2, 100.0, "deposit", "dep-1", "Deposit").unwrap();

        // A concurrent purchase slipped in after the precondition check:
        // the hold exists but the purchase record does not yet.
        let conn = svc.store().open().unwrap();
        svc.store()
            .create_escrow_in(&conn, 2, ticket.id, 30.0, &format!("ticket-{}", ticket.id))
            .unwrap();
        drop(conn);

        let err = svc.purchase(2, ticket.id).unwrap_err();
        assert!(matches!(err, PurchaseError::AlreadyPurchased));

        // Debit was reversed: balance unchanged, exactly one hold, and no
        // purchase record or counter bump leaked out of the transaction.
        assert_eq!(svc.wallet().balance(2).unwrap(), 100.0);
        assert_eq!(svc.store().escrows_for_ticket(ticket.id).unwrap().len(), 1);
        let conn = svc.store().open().unwrap();
        assert!(!svc.store().has_purchase_in(&conn, 2, ticket.id).unwrap());
        drop(conn);
        assert_eq!(svc.store().listing(ticket.id).unwrap().unwrap().purchase_count, 0);

        let txs = svc.wallet().transactions(2, 10).unwrap();
        let refund = txs.iter().find(|t| t.kind == "refund").unwrap();
        assert_eq!(refund.amount, 30.0);
        assert_eq!(
            refund.reference.as_deref(),
            Some(format!("ticket-{}-refund", ticket.id).as_str())
        );
        // The debit it reverses is on the ledger too
        assert!(txs.iter().any(|t| t.kind == "purchase" && t.amount == -30.0));
    }

    #[test]
    fn test_free_ticket_skips_the_ledger() {
        let (svc, _temp) = service();
        let ticket = listed_ticket(&svc, 1, 0.0);

        svc.purchase(2, ticket.id).unwrap();

        assert_eq!(svc.wallet().balance(2).unwrap(), 0.0);
        assert!(svc.wallet().transactions(2, 10).unwrap().is_empty());
        // Hold is still recorded so settlement sees the buyer.
        assert_eq!(svc.store().escrows_for_ticket(ticket.id).unwrap().len(), 1);
    }
}
