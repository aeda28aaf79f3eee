//! Settlement Engine
//! Mission: turn finished matches into leg results, ticket results and money
//!
//! Design principles:
//! - A leg or ticket settles exactly once. All state flips ride on
//!   `pending`-guarded UPDATEs, so two overlapping passes cannot both win.
//! - Money movement is idempotent through ledger references. Re-running a
//!   pass after a crash re-attempts credits; the ledger drops duplicates.
//! - One bad ticket never poisons the pass. Failures are logged per ticket
//!   and the loop moves on.
//! - A ticket is never partially settled: aggregation waits until every
//!   leg has a result.

use crate::models::{round2, EngineConfig, EscrowStatus, ResultStatus, SettlementReport, Ticket};
use crate::notify::{LogNotifier, Notification, NotificationSink};
use crate::resolver::{resolve, Resolution};
use crate::store::{FixtureSource, SettlementStore, SqliteFixtureSource};
use crate::wallet::WalletLedger;
use anyhow::Result;
use std::collections::{HashMap, HashSet};
use tracing::{error, info, warn};

pub struct SettlementEngine {
    store: SettlementStore,
    wallet: WalletLedger,
    fixtures: Box<dyn FixtureSource + Send + Sync>,
    notifier: Box<dyn NotificationSink>,
    config: EngineConfig,
}

impl SettlementEngine {
    pub fn new(db_path: &str, config: EngineConfig) -> Result<Self> {
        Self::with_notifier(db_path, config, Box::new(LogNotifier))
    }

    pub fn with_notifier(
        db_path: &str,
        config: EngineConfig,
        notifier: Box<dyn NotificationSink>,
    ) -> Result<Self> {
        Ok(Self {
            store: SettlementStore::new(db_path)?,
            wallet: WalletLedger::new(db_path)?,
            fixtures: Box::new(SqliteFixtureSource::new(db_path)?),
            notifier,
            config: config.validated(),
        })
    }

    pub fn store(&self) -> &SettlementStore {
        &self.store
    }

    pub fn wallet(&self) -> &WalletLedger {
        &self.wallet
    }

    /// One full settlement pass: resolve legs against finished matches,
    /// then settle every ticket whose legs are all decided.
    pub fn run_settlement(&self) -> Result<SettlementReport> {
        let mut report = SettlementReport::default();

        // Step 1: what has finished since the last pass?
        let finished = self.fixtures.list_finished(self.config.grace_window_hours)?;
        let by_match: HashMap<_, _> = finished
            .iter()
            .map(|m| ((m.kind, m.id), m))
            .collect();

        // Step 2: resolve pending legs whose match is among them.
        let mut stuck_legs: u64 = 0;
        for leg in self.store.pending_legs()? {
            let Some(m) = by_match.get(&(leg.match_kind, leg.match_id)) else {
                continue;
            };
            let resolution = resolve(
                &leg.prediction,
                m.home_score,
                m.away_score,
                m.home_name.as_deref(),
                m.away_name.as_deref(),
            );
            let result = match resolution {
                Resolution::Won => ResultStatus::Won,
                Resolution::Lost => ResultStatus::Lost,
                Resolution::Void => ResultStatus::Void,
                Resolution::Unresolved => {
                    // Match is over but the market text is beyond us. Leave
                    // the leg pending for an operator; surface it as a gauge.
                    warn!(
                        leg_id = leg.id,
                        ticket_id = leg.ticket_id,
                        prediction = %leg.prediction,
                        "Leg unresolvable against final score"
                    );
                    stuck_legs += 1;
                    continue;
                }
            };
            match self.store.set_leg_result(leg.id, result) {
                Ok(true) => report.legs_updated += 1,
                Ok(false) => {}
                Err(e) => {
                    error!(leg_id = leg.id, error = %e, "Failed to persist leg result");
                }
            }
        }
        metrics::gauge!("settlement_stuck_legs", stuck_legs as f64);

        // Step 3: settle tickets with no pending legs left.
        for ticket in self.store.pending_tickets()? {
            match self.settle_ticket(&ticket) {
                Ok(true) => report.tickets_settled += 1,
                Ok(false) => {}
                Err(e) => {
                    error!(ticket_id = ticket.id, error = %e, "Ticket settlement failed");
                }
            }
        }

        // Step 4: retry distribution for tickets that settled but kept
        // their holds. A crash between the ticket flip and the payout
        // strands them here, and the pending-ticket scan never returns.
        let stranded = self.store.settled_tickets_with_held_escrow()?;
        metrics::gauge!("settlement_stuck_escrows", stranded.len() as f64);
        for ticket in stranded {
            warn!(
                ticket_id = ticket.id,
                result = ticket.result.as_str(),
                "Settled ticket still holds escrow, retrying distribution"
            );
            if let Err(e) = self.settle_escrow(&ticket, ticket.result) {
                error!(ticket_id = ticket.id, error = %e, "Escrow retry failed");
            }
        }

        metrics::counter!("settlement_legs_updated", report.legs_updated);
        metrics::counter!("settlement_tickets_settled", report.tickets_settled);
        info!(
            legs_updated = report.legs_updated,
            tickets_settled = report.tickets_settled,
            "Settlement pass complete"
        );
        Ok(report)
    }

    /// Aggregate a ticket's leg results and settle it if complete.
    /// Returns true only when this call performed the settlement.
    fn settle_ticket(&self, ticket: &Ticket) -> Result<bool> {
        let legs = self.store.legs_for_ticket(ticket.id)?;
        if legs.is_empty() || legs.iter().any(|l| !l.result.is_settled()) {
            return Ok(false);
        }

        // Lost dominates. Void legs never block a win; the ticket itself
        // voids only when every leg voided.
        let result = if legs.iter().any(|l| l.result == ResultStatus::Lost) {
            ResultStatus::Lost
        } else if legs.iter().all(|l| l.result == ResultStatus::Void) {
            ResultStatus::Void
        } else {
            ResultStatus::Won
        };

        if !self.store.settle_ticket(ticket.id, result)? {
            // Another pass settled it between our read and this write.
            return Ok(false);
        }
        info!(ticket_id = ticket.id, result = result.as_str(), "Ticket settled");

        if ticket.is_marketplace && ticket.price > 0.0 {
            self.settle_escrow(ticket, result)?;
        }

        self.notifier.notify(
            ticket.user_id,
            Notification::new(
                "ticket_settled",
                "Ticket settled",
                &format!("Your ticket \"{}\" finished {}", ticket.title, result.as_str()),
                Some(format!("/tickets/{}", ticket.id)),
            ),
        );
        Ok(true)
    }

    /// Distribute a settled ticket's escrow. On a win the seller receives
    /// the held total minus commission; on a loss or void every buyer gets
    /// their full stake back. Each hold transitions exactly once and every
    /// credit carries a reference, so replays cannot double-pay.
    fn settle_escrow(&self, ticket: &Ticket, result: ResultStatus) -> Result<()> {
        let all_holds = self.store.held_escrows(ticket.id)?;
        if all_holds.is_empty() {
            return Ok(());
        }
        let reference = format!("ticket-{}", ticket.id);

        // Each buyer counts once. The unique index on (user_id, ticket_id)
        // should make duplicates impossible, but money math re-checks:
        // extra holds for a buyer are skipped and closed without payment.
        let mut seen_buyers = HashSet::new();
        let mut holds = Vec::with_capacity(all_holds.len());
        let mut duplicates = Vec::new();
        for hold in &all_holds {
            if seen_buyers.insert(hold.user_id) {
                holds.push(hold);
            } else {
                warn!(
                    ticket_id = ticket.id,
                    hold_id = hold.id,
                    user_id = hold.user_id,
                    "Duplicate escrow hold for buyer, excluding from distribution"
                );
                duplicates.push(hold);
            }
        }

        let terminal = if result == ResultStatus::Won {
            let gross = round2(holds.iter().map(|h| h.amount).sum());
            let commission = round2(gross * self.config.commission_rate_pct / 100.0);
            let net = round2(gross - commission);

            self.wallet.credit(
                ticket.user_id,
                net,
                "payout",
                &reference,
                &format!("Payout for winning ticket \"{}\"", ticket.title),
            )?;
            self.wallet.record_transaction(
                ticket.user_id,
                commission,
                "commission",
                &reference,
                &format!("Platform commission on ticket \"{}\"", ticket.title),
                Some(serde_json::json!({
                    "gross": gross,
                    "rate_pct": self.config.commission_rate_pct,
                })),
            )?;

            for hold in &holds {
                self.store.mark_escrow(hold.id, EscrowStatus::Released)?;
                self.notifier.notify(
                    hold.user_id,
                    Notification::new(
                        "ticket_won",
                        "Your purchase won",
                        &format!("\"{}\" won at odds {:.2}", ticket.title, ticket.combined_odds),
                        Some(format!("/tickets/{}", ticket.id)),
                    ),
                );
            }
            info!(
                ticket_id = ticket.id,
                seller_id = ticket.user_id,
                gross,
                commission,
                net,
                "Escrow released to seller"
            );
            metrics::counter!("escrow_released", 1);
            EscrowStatus::Released
        } else {
            for hold in &holds {
                self.wallet.credit(
                    hold.user_id,
                    hold.amount,
                    "refund",
                    &reference,
                    &format!("Refund for ticket \"{}\" ({})", ticket.title, result.as_str()),
                )?;
                self.store.mark_escrow(hold.id, EscrowStatus::Refunded)?;
                self.notifier.notify(
                    hold.user_id,
                    Notification::new(
                        "ticket_refunded",
                        "Purchase refunded",
                        &format!(
                            "\"{}\" finished {}, your {:.2} was returned",
                            ticket.title,
                            result.as_str(),
                            hold.amount
                        ),
                        Some(format!("/tickets/{}", ticket.id)),
                    ),
                );
            }
            info!(
                ticket_id = ticket.id,
                buyers = holds.len(),
                "Escrow refunded to buyers"
            );
            metrics::counter!("escrow_refunded", holds.len() as u64);
            EscrowStatus::Refunded
        };

        // Duplicates carry no money but must not stay 'held', or every
        // pass would revisit this ticket forever.
        for hold in &duplicates {
            self.store.mark_escrow(hold.id, terminal)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::MatchKind;
    use crate::notify::testing::RecordingNotifier;
    use crate::store::NewLeg;
    use chrono::{Duration, Utc};
    use std::sync::Arc;
    use tempfile::NamedTempFile;

    struct SharedNotifier(Arc<RecordingNotifier>);

    impl NotificationSink for SharedNotifier {
        fn notify(&self, user_id: i64, notification: Notification) {
            self.0.notify(user_id, notification);
        }
    }

    struct Harness {
        engine: SettlementEngine,
        fixtures: SqliteFixtureSource,
        notifier: Arc<RecordingNotifier>,
        _temp: NamedTempFile,
    }

    fn harness(config: EngineConfig) -> Harness {
        let temp = NamedTempFile::new().unwrap();
        let path = temp.path().to_str().unwrap().to_string();
        let notifier = Arc::new(RecordingNotifier::default());
        let engine = SettlementEngine::with_notifier(
            &path,
            config,
            Box::new(SharedNotifier(notifier.clone())),
        )
        .unwrap();
        let fixtures = SqliteFixtureSource::new(&path).unwrap();
        Harness {
            engine,
            fixtures,
            notifier,
            _temp: temp,
        }
    }

    fn leg(match_id: i64, prediction: &str, odds: f64) -> NewLeg {
        NewLeg {
            match_id,
            match_kind: MatchKind::Fixture,
            prediction: prediction.to_string(),
            odds,
            match_date: Some(Utc::now() - Duration::hours(4)),
        }
    }

    fn finished(h: &Harness, id: i64, home: &str, away: &str, hs: i64, aw: i64) {
        h.fixtures
            .upsert_match(
                MatchKind::Fixture,
                id,
                home,
                away,
                Some(hs),
                Some(aw),
                "FT",
                Utc::now() - Duration::hours(4),
            )
            .unwrap();
    }

    #[test]
    fn test_run_settlement_settles_won_ticket() {
        let h = harness(EngineConfig::default());
        let store = h.engine.store();
        let ticket = store
            .create_ticket(1, "double", 0.0, false, &[leg(1, "home", 1.5), leg(2, "over 2.5", 1.9)])
            .unwrap();
        finished(&h, 1, "A", "B", 2, 0);
        finished(&h, 2, "C", "D", 3, 1);

        let report = h.engine.run_settlement().unwrap();
        assert_eq!(report.legs_updated, 2);
        assert_eq!(report.tickets_settled, 1);
        assert_eq!(
            store.ticket(ticket.id).unwrap().unwrap().result,
            ResultStatus::Won
        );
    }

    #[test]
    fn test_lost_leg_dominates_ticket() {
        let h = harness(EngineConfig::default());
        let store = h.engine.store();
        let ticket = store
            .create_ticket(1, "double", 0.0, false, &[leg(1, "home", 1.5), leg(2, "away", 2.2)])
            .unwrap();
        finished(&h, 1, "A", "B", 2, 0); // home wins -> leg won
        finished(&h, 2, "C", "D", 3, 1); // home wins -> "away" leg lost

        h.engine.run_settlement().unwrap();
        assert_eq!(
            store.ticket(ticket.id).unwrap().unwrap().result,
            ResultStatus::Lost
        );
    }

    #[test]
    fn test_void_leg_does_not_block_a_win() {
        let h = harness(EngineConfig::default());
        let store = h.engine.store();
        let ticket = store
            .create_ticket(
                1,
                "dnb draw",
                0.0,
                false,
                &[leg(1, "home", 1.5), leg(2, "draw no bet home", 1.8)],
            )
            .unwrap();
        finished(&h, 1, "A", "B", 2, 0);
        finished(&h, 2, "C", "D", 1, 1); // draw -> DNB void

        h.engine.run_settlement().unwrap();
        assert_eq!(
            store.ticket(ticket.id).unwrap().unwrap().result,
            ResultStatus::Won
        );
    }

    #[test]
    fn test_all_void_legs_void_the_ticket() {
        let h = harness(EngineConfig::default());
        let store = h.engine.store();
        let ticket = store
            .create_ticket(
                1,
                "all dnb",
                0.0,
                false,
                &[leg(1, "dnb home", 1.4), leg(2, "draw no bet away", 1.6)],
            )
            .unwrap();
        finished(&h, 1, "A", "B", 1, 1);
        finished(&h, 2, "C", "D", 2, 2);

        h.engine.run_settlement().unwrap();
        assert_eq!(
            store.ticket(ticket.id).unwrap().unwrap().result,
            ResultStatus::Void
        );
    }

    #[test]
    fn test_void_plus_lost_is_lost() {
        let h = harness(EngineConfig::default());
        let store = h.engine.store();
        let ticket = store
            .create_ticket(
                1,
                "dnb and a miss",
                0.0,
                false,
                &[leg(1, "dnb home", 1.4), leg(2, "away", 2.5)],
            )
            .unwrap();
        finished(&h, 1, "A", "B", 1, 1); // void
        finished(&h, 2, "C", "D", 3, 0); // away lost

        h.engine.run_settlement().unwrap();
        assert_eq!(
            store.ticket(ticket.id).unwrap().unwrap().result,
            ResultStatus::Lost
        );
    }

    #[test]
    fn test_ticket_waits_for_all_legs() {
        let h = harness(EngineConfig::default());
        let store = h.engine.store();
        let ticket = store
            .create_ticket(1, "double", 0.0, false, &[leg(1, "home", 1.5), leg(2, "home", 1.5)])
            .unwrap();
        finished(&h, 1, "A", "B", 0, 2); // first leg lost

        let report = h.engine.run_settlement().unwrap();
        assert_eq!(report.legs_updated, 1);
        // Lost already guaranteed, but never settle while a leg is pending.
        assert_eq!(report.tickets_settled, 0);
        assert_eq!(
            store.ticket(ticket.id).unwrap().unwrap().result,
            ResultStatus::Pending
        );

        finished(&h, 2, "C", "D", 2, 0);
        h.engine.run_settlement().unwrap();
        assert_eq!(
            store.ticket(ticket.id).unwrap().unwrap().result,
            ResultStatus::Lost
        );
    }

    #[test]
    fn test_unresolvable_leg_stays_pending() {
        let h = harness(EngineConfig::default());
        let store = h.engine.store();
        let ticket = store
            .create_ticket(1, "exotic", 0.0, false, &[leg(1, "first goalscorer haaland", 3.0)])
            .unwrap();
        finished(&h, 1, "A", "B", 2, 0);

        let report = h.engine.run_settlement().unwrap();
        assert_eq!(report.legs_updated, 0);
        assert_eq!(report.tickets_settled, 0);
        assert_eq!(
            store.legs_for_ticket(ticket.id).unwrap()[0].result,
            ResultStatus::Pending
        );
    }

    #[test]
    fn test_escrow_won_pays_seller_net_of_commission() {
        let h = harness(EngineConfig {
            commission_rate_pct: 10.0,
            grace_window_hours: 2,
        });
        let store = h.engine.store();
        let wallet = h.engine.wallet();

        let ticket = store
            .create_ticket(1, "banker", 100.0, true, &[leg(1, "home", 1.5)])
            .unwrap();
        let conn = store.open().unwrap();
        store
            .create_escrow_in(&conn, 2, ticket.id, 100.0, &format!("ticket-{}", ticket.id))
            .unwrap();
        drop(conn);
        finished(&h, 1, "A", "B", 2, 0);

        h.engine.run_settlement().unwrap();

        // 100 gross, 10% commission, 90 net to the seller
        assert_eq!(wallet.balance(1).unwrap(), 90.0);
        let seller_txs = wallet.transactions(1, 10).unwrap();
        let commission = seller_txs.iter().find(|t| t.kind == "commission").unwrap();
        assert_eq!(commission.amount, 10.0);
        assert!(!commission.balance_affecting);

        let holds = store.escrows_for_ticket(ticket.id).unwrap();
        assert_eq!(holds[0].status, EscrowStatus::Released);

        let sent = h.notifier.sent.lock().unwrap();
        assert!(sent.iter().any(|(uid, n)| *uid == 2 && n.kind == "ticket_won"));
    }

    #[test]
    fn test_escrow_lost_refunds_every_buyer_in_full() {
        let h = harness(EngineConfig::default());
        let store = h.engine.store();
        let wallet = h.engine.wallet();

        let ticket = store
            .create_ticket(1, "flop", 50.0, true, &[leg(1, "home", 1.5)])
            .unwrap();
        let conn = store.open().unwrap();
        let reference = format!("ticket-{}", ticket.id);
        store.create_escrow_in(&conn, 2, ticket.id, 50.0, &reference).unwrap();
        store.create_escrow_in(&conn, 3, ticket.id, 50.0, &reference).unwrap();
        drop(conn);
        finished(&h, 1, "A", "B", 0, 1); // home loses

        h.engine.run_settlement().unwrap();

        assert_eq!(wallet.balance(2).unwrap(), 50.0);
        assert_eq!(wallet.balance(3).unwrap(), 50.0);
        // Seller gets nothing
        assert_eq!(wallet.balance(1).unwrap(), 0.0);
        for hold in store.escrows_for_ticket(ticket.id).unwrap() {
            assert_eq!(hold.status, EscrowStatus::Refunded);
        }
    }

    #[test]
    fn test_second_pass_is_a_no_op() {
        let h = harness(EngineConfig::default());
        let store = h.engine.store();
        let wallet = h.engine.wallet();

        let ticket = store
            .create_ticket(1, "banker", 100.0, true, &[leg(1, "home", 1.5)])
            .unwrap();
        let conn = store.open().unwrap();
        store
            .create_escrow_in(&conn, 2, ticket.id, 100.0, &format!("ticket-{}", ticket.id))
            .unwrap();
        drop(conn);
        finished(&h, 1, "A", "B", 2, 0);

        h.engine.run_settlement().unwrap();
        let balance_after_first = wallet.balance(1).unwrap();

        let report = h.engine.run_settlement().unwrap();
        assert_eq!(report.legs_updated, 0);
        assert_eq!(report.tickets_settled, 0);
        assert_eq!(wallet.balance(1).unwrap(), balance_after_first);
    }

    #[test]
    fn test_commission_rounding() {
        let h = harness(EngineConfig {
            commission_rate_pct: 10.0,
            grace_window_hours: 2,
        });
        let store = h.engine.store();
        let wallet = h.engine.wallet();

        let ticket = store
            .create_ticket(1, "odd price", 33.33, true, &[leg(1, "home", 1.5)])
            .unwrap();
        let conn = store.open().unwrap();
        store
            .create_escrow_in(&conn, 2, ticket.id, 33.33, &format!("ticket-{}", ticket.id))
            .unwrap();
        drop(conn);
        finished(&h, 1, "A", "B", 2, 0);

        h.engine.run_settlement().unwrap();

        // commission = round2(33.33 * 0.10) = 3.33, net = 30.00
        assert_eq!(wallet.balance(1).unwrap(), 30.0);
        let txs = wallet.transactions(1, 10).unwrap();
        assert_eq!(
            txs.iter().find(|t| t.kind == "commission").unwrap().amount,
            3.33
        );
    }

    #[test]
    fn test_duplicate_hold_counts_the_buyer_once_on_a_win() {
        let h = harness(EngineConfig {
            commission_rate_pct: 10.0,
            grace_window_hours: 2,
        });
        let store = h.engine.store();
        let wallet = h.engine.wallet();

        let ticket = store
            .create_ticket(1, "banker", 100.0, true, &[leg(1, "home", 1.5)])
            .unwrap();
        let conn = store.open().unwrap();
        let reference = format!("ticket-{}", ticket.id);
        store.create_escrow_in(&conn, 2, ticket.id, 100.0, &reference).unwrap();
        // A second hold for the same buyer, as a broken migration or manual
        // insert could leave behind. Lift the index to get it in.
        conn.execute("DROP INDEX idx_escrow_buyer_ticket", []).unwrap();
        store.create_escrow_in(&conn, 2, ticket.id, 100.0, &reference).unwrap();
        drop(conn);
        finished(&h, 1, "A", "B", 2, 0);

        h.engine.run_settlement().unwrap();

        // One buyer staked 100 once: seller nets 90, not 180
        assert_eq!(wallet.balance(1).unwrap(), 90.0);
        let holds = store.escrows_for_ticket(ticket.id).unwrap();
        assert_eq!(holds.len(), 2);
        assert!(holds.iter().all(|hold| hold.status == EscrowStatus::Released));
    }

    #[test]
    fn test_duplicate_hold_refunds_the_buyer_once_on_a_loss() {
        let h = harness(EngineConfig::default());
        let store = h.engine.store();
        let wallet = h.engine.wallet();

        let ticket = store
            .create_ticket(1, "flop", 50.0, true, &[leg(1, "home", 1.5)])
            .unwrap();
        let conn = store.open().unwrap();
        let reference = format!("ticket-{}", ticket.id);
        store.create_escrow_in(&conn, 2, ticket.id, 50.0, &reference).unwrap();
        conn.execute("DROP INDEX idx_escrow_buyer_ticket", []).unwrap();
        store.create_escrow_in(&conn, 2, ticket.id, 50.0, &reference).unwrap();
        drop(conn);
        finished(&h, 1, "A", "B", 0, 1);

        h.engine.run_settlement().unwrap();

        assert_eq!(wallet.balance(2).unwrap(), 50.0);
        let holds = store.escrows_for_ticket(ticket.id).unwrap();
        assert_eq!(holds.len(), 2);
        assert!(holds.iter().all(|hold| hold.status == EscrowStatus::Refunded));

        // Nothing left for later passes to revisit
        let report = h.engine.run_settlement().unwrap();
        assert_eq!(report.tickets_settled, 0);
        assert_eq!(wallet.balance(2).unwrap(), 50.0);
    }

    #[test]
    fn test_stranded_escrow_is_swept_on_the_next_pass() {
        let h = harness(EngineConfig::default());
        let store = h.engine.store();
        let wallet = h.engine.wallet();

        let ticket = store
            .create_ticket(1, "flop", 40.0, true, &[leg(1, "home", 1.5)])
            .unwrap();
        let conn = store.open().unwrap();
        store
            .create_escrow_in(&conn, 2, ticket.id, 40.0, &format!("ticket-{}", ticket.id))
            .unwrap();
        drop(conn);

        // The previous pass flipped the ticket and then died before
        // touching the escrow.
        store.settle_ticket(ticket.id, ResultStatus::Lost).unwrap();

        let report = h.engine.run_settlement().unwrap();
        assert_eq!(report.tickets_settled, 0);
        assert_eq!(wallet.balance(2).unwrap(), 40.0);
        assert_eq!(
            store.escrows_for_ticket(ticket.id).unwrap()[0].status,
            EscrowStatus::Refunded
        );
    }

    #[test]
    fn test_stranded_winning_escrow_pays_the_seller() {
        let h = harness(EngineConfig {
            commission_rate_pct: 10.0,
            grace_window_hours: 2,
        });
        let store = h.engine.store();
        let wallet = h.engine.wallet();

        let ticket = store
            .create_ticket(1, "banker", 100.0, true, &[leg(1, "home", 1.5)])
            .unwrap();
        let conn = store.open().unwrap();
        store
            .create_escrow_in(&conn, 2, ticket.id, 100.0, &format!("ticket-{}", ticket.id))
            .unwrap();
        drop(conn);
        store.settle_ticket(ticket.id, ResultStatus::Won).unwrap();

        h.engine.run_settlement().unwrap();

        assert_eq!(wallet.balance(1).unwrap(), 90.0);
        assert_eq!(
            store.escrows_for_ticket(ticket.id).unwrap()[0].status,
            EscrowStatus::Released
        );
    }
}
