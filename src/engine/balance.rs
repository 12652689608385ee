//! Account balance with dust filtering, per-currency precision and
//! checkpoint diffs.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use rust_decimal::{Decimal, RoundingStrategy};
use tracing::{debug, info};

use crate::exchange::{Currency, FreeBalance, Market};
use crate::opportunity::Opportunity;

/// Amounts below this are treated as empty.
pub const DUST_THRESHOLD: Decimal = Decimal::from_parts(1, 0, 0, false, 6);

/// Snapshot of all amounts taken before an exploit.
pub type BalanceCheckpoint = BTreeMap<Currency, Decimal>;

/// Free balance per currency.
#[derive(Debug, Clone, Default)]
pub struct Balance {
    amounts: BTreeMap<Currency, Decimal>,
    excluded: BTreeSet<Currency>,
    precisions: HashMap<Currency, u32>,
}

impl Balance {
    /// Empty balance ignoring the given currencies.
    pub fn new<I, S>(excluded: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<Currency>,
    {
        Self {
            excluded: excluded.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    /// Take each currency's precision from the markets it is the base of.
    pub fn set_precisions(&mut self, markets: &[Market]) {
        for market in markets {
            self.precisions
                .entry(market.base.clone())
                .or_insert(market.amount_precision);
        }
    }

    /// Replace all amounts from an exchange response. Dust, zero and excluded
    /// entries are dropped; amounts are truncated to the currency's precision.
    pub fn replace(&mut self, free: &FreeBalance) {
        self.amounts = free
            .iter()
            .filter(|(currency, _)| !self.excluded.contains(*currency))
            .filter_map(|(currency, amount)| {
                let amount = match self.precisions.get(currency) {
                    Some(dp) => amount.round_dp_with_strategy(*dp, RoundingStrategy::ToZero),
                    None => *amount,
                };
                (amount >= DUST_THRESHOLD).then(|| (currency.clone(), amount.normalize()))
            })
            .collect();

        info!(currencies = self.amounts.len(), "Balance updated");
        debug!(balance = ?self.amounts, "Balance detail");
    }

    /// Amount held, if any.
    pub fn get(&self, currency: &str) -> Option<Decimal> {
        self.amounts.get(currency).copied()
    }

    /// Whether any amount is held.
    pub fn has(&self, currency: &str) -> bool {
        self.amounts.contains_key(currency)
    }

    /// All amounts.
    pub fn amounts(&self) -> &BTreeMap<Currency, Decimal> {
        &self.amounts
    }

    /// Snapshot for a later [`Balance::diff`].
    pub fn checkpoint(&self) -> BalanceCheckpoint {
        self.amounts.clone()
    }

    /// Per-currency change since `checkpoint`. Unchanged currencies are
    /// omitted; new ones appear with their full amount and vanished ones
    /// with the negated amount.
    pub fn diff(&self, checkpoint: &BalanceCheckpoint) -> BTreeMap<Currency, Decimal> {
        let mut diff = BTreeMap::new();

        for (currency, amount) in &self.amounts {
            let before = checkpoint.get(currency).copied().unwrap_or(Decimal::ZERO);
            if *amount != before {
                diff.insert(currency.clone(), amount - before);
            }
        }
        for (currency, before) in checkpoint {
            if !self.amounts.contains_key(currency) {
                diff.insert(currency.clone(), -before);
            }
        }

        diff
    }

    /// Held currencies that are nodes of the opportunity, in cycle order.
    pub fn intersection(&self, opportunity: &Opportunity) -> Vec<Currency> {
        opportunity
            .nodes()
            .into_iter()
            .filter(|c| self.has(c))
            .collect()
    }

    /// Whether the opportunity, already rotated to the held currency, can be
    /// traded with this balance.
    ///
    /// Requires a defined maximum volume above the minimum and a balance above
    /// `min / margin`. With `cap_by_max_volume` the balance must also stay
    /// below `max * margin`.
    pub fn sufficient(&self, opportunity: &Opportunity, margin: Decimal, cap_by_max_volume: bool) -> bool {
        let Some(max) = opportunity.max_volume() else {
            return false;
        };
        let Some(balance) = self.get(opportunity.reference_unit()) else {
            return false;
        };
        let min = opportunity.min_volume();

        let above_min = margin > Decimal::ZERO && min / margin < balance;
        let below_cap = !cap_by_max_volume || max * margin > balance;

        debug!(
            opportunity = %opportunity.id(),
            currency = %opportunity.reference_unit(),
            min = %min,
            max = %max,
            balance = %balance,
            "Balance sufficiency check"
        );

        min < max && above_min && below_cap
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Edge;
    use pretty_assertions::assert_eq;
    use rust_decimal_macros::dec;

    fn free(entries: &[(&str, Decimal)]) -> FreeBalance {
        entries.iter().map(|(c, a)| (c.to_string(), *a)).collect()
    }

    fn opportunity(volume: Option<Decimal>, min: Decimal) -> Opportunity {
        let mut edges = [
            Edge::direct("BTC", "ETH", dec!(0), min),
            Edge::direct("ETH", "USD", dec!(0), dec!(0)),
            Edge::direct("USD", "BTC", dec!(0), dec!(0)),
        ];
        // volume is the BTC size; each leg's book holds the same value in its source
        let scale = [dec!(1), dec!(20), dec!(20000)];
        for ((edge, price), factor) in edges.iter_mut().zip([dec!(20), dec!(1000), dec!(0.00005)]).zip(scale) {
            edge.set_real_price(price).unwrap();
            if let Some(volume) = volume {
                edge.set_real_volume(volume * factor);
            }
        }
        Opportunity::new("mock", edges)
    }

    #[test]
    fn diff_reports_changed_and_new_currencies() {
        let mut balance = Balance::default();
        balance.replace(&free(&[("BTC", dec!(1)), ("ETH", dec!(2))]));
        let checkpoint = balance.checkpoint();

        balance.replace(&free(&[("BTC", dec!(1.2)), ("ETH", dec!(2)), ("XMR", dec!(0.5))]));

        let expected: BTreeMap<Currency, Decimal> =
            [("BTC".to_string(), dec!(0.2)), ("XMR".to_string(), dec!(0.5))].into();
        assert_eq!(balance.diff(&checkpoint), expected);
    }

    #[test]
    fn diff_reports_vanished_currency_as_negative() {
        let mut balance = Balance::default();
        balance.replace(&free(&[("BTC", dec!(1)), ("ETH", dec!(2))]));
        let checkpoint = balance.checkpoint();

        balance.replace(&free(&[("BTC", dec!(1))]));

        assert_eq!(balance.diff(&checkpoint).get("ETH"), Some(&dec!(-2)));
    }

    #[test]
    fn replace_drops_dust_zero_and_excluded() {
        let mut balance = Balance::new(["DTH"]);
        balance.replace(&free(&[
            ("BTC", dec!(0.5)),
            ("ETH", dec!(0)),
            ("XRP", dec!(0.0000000012)),
            ("DTH", dec!(100)),
        ]));

        assert!(balance.has("BTC"));
        assert!(!balance.has("ETH"));
        assert!(!balance.has("XRP"));
        assert!(!balance.has("DTH"));
    }

    #[test]
    fn replace_truncates_to_precision() {
        let mut balance = Balance::default();
        let mut market = Market::new("ETH", "BTC", dec!(0), dec!(0));
        market.amount_precision = 3;
        balance.set_precisions(&[market]);

        balance.replace(&free(&[("ETH", dec!(1.23456))]));

        assert_eq!(balance.get("ETH"), Some(dec!(1.234)));
    }

    #[test]
    fn intersection_follows_cycle_order() {
        let mut balance = Balance::default();
        balance.replace(&free(&[("USD", dec!(100)), ("BTC", dec!(1)), ("LTC", dec!(3))]));

        assert_eq!(balance.intersection(&opportunity(None, dec!(0))), vec!["BTC", "USD"]);
    }

    #[test]
    fn sufficient_requires_defined_bounds_and_margin() {
        let mut balance = Balance::default();
        balance.replace(&free(&[("BTC", dec!(1))]));

        assert!(!balance.sufficient(&opportunity(None, dec!(0.01)), dec!(0.9), false));
        assert!(balance.sufficient(&opportunity(Some(dec!(10)), dec!(0.01)), dec!(0.9), false));
        // min / margin above the balance
        assert!(!balance.sufficient(&opportunity(Some(dec!(10)), dec!(0.95)), dec!(0.9), false));
        // balance above max * margin
        assert!(!balance.sufficient(&opportunity(Some(dec!(0.5)), dec!(0.01)), dec!(0.9), true));
    }
}
