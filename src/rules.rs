// 🏷️ Categorization Rules - Rules as Data
// Wildcard patterns over the transaction description, configurable per run

use crate::config::strip_accents;
use serde::{Deserialize, Serialize};

/// Category assigned when no rule matches
pub const FALLBACK_CATEGORY: &str = "outros";

// ============================================================================
// RULE DEFINITION
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryRule {
    /// Rule ID for tracking
    pub id: String,

    /// Pattern to match (supports wildcards with *)
    pub pattern: String,

    /// Category to assign
    pub category: String,

    /// Priority (higher = applied first)
    #[serde(default)]
    pub priority: i32,
}

impl CategoryRule {
    pub fn new(id: &str, pattern: &str, category: &str, priority: i32) -> Self {
        CategoryRule {
            id: id.to_string(),
            pattern: pattern.to_string(),
            category: category.to_string(),
            priority,
        }
    }

    /// Check if pattern matches the given text (case and accent insensitive)
    pub fn matches(&self, text: &str) -> bool {
        let pattern = fold(&self.pattern);
        let text = fold(text);

        if !pattern.contains('*') {
            return text.contains(&pattern);
        }

        let parts: Vec<&str> = pattern.split('*').collect();
        let first = parts[0];
        let last = parts[parts.len() - 1];

        if !text.starts_with(first) || !text.ends_with(last) {
            return false;
        }
        if first.len() + last.len() > text.len() {
            return false;
        }

        // Middle parts must appear in order between the anchors
        let mut cursor = first.len();
        let end = text.len() - last.len();
        for part in &parts[1..parts.len() - 1] {
            if part.is_empty() {
                continue;
            }
            match text[cursor..end].find(part) {
                Some(pos) => cursor += pos + part.len(),
                None => return false,
            }
        }

        true
    }
}

fn fold(text: &str) -> String {
    strip_accents(&text.trim().to_lowercase())
}

// ============================================================================
// CATEGORY ENGINE
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct CategoryEngine {
    rules: Vec<CategoryRule>,
}

impl CategoryEngine {
    /// Build the engine; rules are ordered by priority, ties keep config order
    pub fn from_rules(mut rules: Vec<CategoryRule>) -> Self {
        rules.sort_by(|a, b| b.priority.cmp(&a.priority));
        CategoryEngine { rules }
    }

    /// First matching rule wins
    pub fn classify(&self, description: &str) -> &str {
        self.rules
            .iter()
            .find(|rule| rule.matches(description))
            .map(|rule| rule.category.as_str())
            .unwrap_or(FALLBACK_CATEGORY)
    }

    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }
}

pub fn default_category_rules() -> Vec<CategoryRule> {
    vec![
        CategoryRule::new("estorno", "estorno*", "estorno", 30),
        CategoryRule::new("pix-saque", "pix saque*", "saque", 25),
        CategoryRule::new("pix", "pix*", "pix", 20),
        CategoryRule::new("ted", "ted*", "ted", 20),
        CategoryRule::new("doc", "doc*", "doc", 20),
        CategoryRule::new("transferencia", "transferencia*", "transferencia", 15),
        CategoryRule::new("compra-credito", "compra credito*", "cartao_credito", 15),
        CategoryRule::new("compra-debito", "compra debito*", "cartao_debito", 15),
        CategoryRule::new("boleto", "*boleto*", "boleto", 10),
        CategoryRule::new("saque", "saque*", "saque", 10),
        CategoryRule::new("deposito", "deposito*", "deposito", 10),
        CategoryRule::new("tarifa", "tarifa", "tarifa", 5),
    ]
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rule_matches_exact() {
        let rule = CategoryRule::new("t", "tarifa", "tarifa", 0);
        assert!(rule.matches("Tarifa mensal"));
        assert!(rule.matches("Cobrança de TARIFA"));
        assert!(!rule.matches("Saque"));
    }

    #[test]
    fn test_rule_matches_wildcard() {
        let rule = CategoryRule::new("pix", "pix*", "pix", 0);
        assert!(rule.matches("Pix - Realizado"));
        assert!(rule.matches("PIX - Recebido"));
        assert!(!rule.matches("Saque Pix"));

        let middle = CategoryRule::new("b", "*boleto*", "boleto", 0);
        assert!(middle.matches("Pagamento de boleto"));
        assert!(middle.matches("Boleto"));
    }

    #[test]
    fn test_rule_matches_ignores_accents() {
        let rule = CategoryRule::new("d", "deposito*", "deposito", 0);
        assert!(rule.matches("Depósito em espécie"));

        let credit = CategoryRule::new("c", "compra credito*", "cartao_credito", 0);
        assert!(credit.matches("Compra Crédito"));
    }

    #[test]
    fn test_rule_overlapping_anchors() {
        let rule = CategoryRule::new("x", "ab*ba", "x", 0);
        assert!(rule.matches("abba"));
        assert!(!rule.matches("aba"));
    }

    #[test]
    fn test_engine_priority_order() {
        let engine = CategoryEngine::from_rules(default_category_rules());

        assert_eq!(engine.classify("Pix Saque"), "saque");
        assert_eq!(engine.classify("Pix - Realizado"), "pix");
        assert_eq!(engine.classify("Estorno de Debito"), "estorno");
        assert_eq!(engine.classify("Compra Débito"), "cartao_debito");
        assert_eq!(engine.classify("Transferência entre CC - Crédito"), "transferencia");
        assert_eq!(engine.classify("Algo desconhecido"), FALLBACK_CATEGORY);
    }

    #[test]
    fn test_engine_without_rules() {
        let engine = CategoryEngine::default();
        assert_eq!(engine.rule_count(), 0);
        assert_eq!(engine.classify("Pix"), FALLBACK_CATEGORY);
    }
}
