//! Ranked multi-field search over the unified dataset.
//!
//! One linear pass per query; there is no persistent index. Each record
//! contributes at most one hit, from its best-scoring field.

use crate::layers::UnifiedEntity;

const EXACT_BONUS: u32 = 50;
const PREFIX_BONUS: u32 = 25;
const WORD_BOUNDARY_BONUS: u32 = 10;

/// Searchable fields, highest priority first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SearchField {
  ElectroId,
  StopId,
  Address,
  Model,
  Neighborhood,
  Area,
}

impl SearchField {
  pub const ALL: [SearchField; 6] = [
    SearchField::ElectroId,
    SearchField::StopId,
    SearchField::Address,
    SearchField::Model,
    SearchField::Neighborhood,
    SearchField::Area,
  ];

  pub fn weight(self) -> u32 {
    match self {
      SearchField::ElectroId => 100,
      SearchField::StopId => 90,
      SearchField::Address => 70,
      SearchField::Model => 50,
      SearchField::Neighborhood => 40,
      SearchField::Area => 30,
    }
  }

  pub fn label(self) -> &'static str {
    match self {
      SearchField::ElectroId => "electroId",
      SearchField::StopId => "stopId",
      SearchField::Address => "address",
      SearchField::Model => "model",
      SearchField::Neighborhood => "neighborhood",
      SearchField::Area => "area",
    }
  }

  fn value(self, entity: &UnifiedEntity) -> Option<&str> {
    let r = &entity.record;
    match self {
      SearchField::ElectroId => r.electro_id.as_deref(),
      SearchField::StopId => r.stop_id.as_deref(),
      SearchField::Address => r.address.as_deref(),
      SearchField::Model => r.model.as_deref(),
      SearchField::Neighborhood => r.neighborhood.as_deref(),
      SearchField::Area => r.area.as_deref(),
    }
  }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
  pub entity: UnifiedEntity,
  pub field: SearchField,
  pub score: u32,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchResults {
  /// Best hits, highest score first, at most `max_results`
  pub results: Vec<SearchHit>,
  /// Matches before truncation
  pub total: usize,
}

/// Bonus for how `needle` sits inside `haystack`, or None when absent.
/// Both sides are already lowercased.
fn match_bonus(haystack: &str, needle: &str) -> Option<u32> {
  if haystack == needle {
    return Some(EXACT_BONUS);
  }
  if haystack.starts_with(needle) {
    return Some(PREFIX_BONUS);
  }

  let mut found = false;
  for (pos, _) in haystack.match_indices(needle) {
    found = true;
    let at_boundary = haystack[..pos]
      .chars()
      .next_back()
      .is_some_and(|c| !c.is_alphanumeric());
    if at_boundary {
      return Some(WORD_BOUNDARY_BONUS);
    }
  }
  found.then_some(0)
}

fn best_match(entity: &UnifiedEntity, needle: &str) -> Option<(SearchField, u32)> {
  let mut best: Option<(SearchField, u32)> = None;
  for field in SearchField::ALL {
    let Some(value) = field.value(entity) else {
      continue;
    };
    let Some(bonus) = match_bonus(&value.to_lowercase(), needle) else {
      continue;
    };
    let score = field.weight() + bonus;
    if best.map_or(true, |(_, s)| score > s) {
      best = Some((field, score));
    }
  }
  best
}

/// Case-insensitive substring search. A blank query matches nothing.
pub fn search(entities: &[UnifiedEntity], query: &str, max_results: usize) -> SearchResults {
  let needle = query.trim().to_lowercase();
  if needle.is_empty() {
    return SearchResults::default();
  }

  let mut scored: Vec<(usize, SearchField, u32)> = entities
    .iter()
    .enumerate()
    .filter_map(|(i, e)| best_match(e, &needle).map(|(field, score)| (i, field, score)))
    .collect();

  let total = scored.len();
  // Stable: equal scores keep dataset order
  scored.sort_by(|a, b| b.2.cmp(&a.2));
  scored.truncate(max_results);

  SearchResults {
    results: scored
      .into_iter()
      .map(|(i, field, score)| SearchHit {
        entity: entities[i].clone(),
        field,
        score,
      })
      .collect(),
    total,
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::layers::EquipmentRecord;

  fn entity(id: &str, address: &str) -> UnifiedEntity {
    UnifiedEntity::bare(EquipmentRecord {
      electro_id: Some(id.to_string()),
      address: Some(address.to_string()),
      ..Default::default()
    })
  }

  #[test]
  fn test_id_match_outranks_address_match() {
    let data = vec![entity("B00001", "Rua A01516 Sul"), entity("A01516", "Av. Brasil")];

    let found = search(&data, "A01516", 10);

    assert_eq!(found.total, 2);
    assert_eq!(found.results[0].entity.id(), Some("A01516"));
    assert_eq!(found.results[0].field, SearchField::ElectroId);
    assert_eq!(found.results[0].score, 150);
    assert_eq!(found.results[1].field, SearchField::Address);
    assert_eq!(found.results[1].score, 80);
  }

  #[test]
  fn test_bonus_ordering() {
    assert_eq!(match_bonus("paulista", "paulista"), Some(EXACT_BONUS));
    assert_eq!(match_bonus("paulista 900", "paulista"), Some(PREFIX_BONUS));
    assert_eq!(match_bonus("av. paulista", "paulista"), Some(WORD_BOUNDARY_BONUS));
    assert_eq!(match_bonus("avpaulista", "paulista"), Some(0));
    assert_eq!(match_bonus("rua augusta", "paulista"), None);
  }

  #[test]
  fn test_boundary_found_on_later_occurrence() {
    assert_eq!(match_bonus("xab ab", "ab"), Some(WORD_BOUNDARY_BONUS));
  }

  #[test]
  fn test_one_hit_per_record_from_best_field() {
    // Matches both id (prefix) and address (exact); the id prefix scores 125,
    // the exact address 120.
    let data = vec![entity("paulista-1", "paulista")];
    let found = search(&data, "PAULISTA", 10);

    assert_eq!(found.total, 1);
    assert_eq!(found.results[0].field, SearchField::ElectroId);
    assert_eq!(found.results[0].score, 125);
  }

  #[test]
  fn test_total_counts_before_truncation() {
    let data: Vec<_> = (0..20)
      .map(|i| entity(&format!("E{i:03}"), "Rua Augusta"))
      .collect();

    let found = search(&data, "augusta", 5);
    assert_eq!(found.total, 20);
    assert_eq!(found.results.len(), 5);
    // Ties keep dataset order
    assert_eq!(found.results[0].entity.id(), Some("E000"));
  }

  #[test]
  fn test_blank_query_matches_nothing() {
    let data = vec![entity("E1", "Rua")];
    assert_eq!(search(&data, "   ", 10), SearchResults::default());
  }

  #[test]
  fn test_orphans_are_searchable() {
    let orphan = UnifiedEntity::bare(EquipmentRecord {
      address: Some("Praça da Sé".into()),
      ..Default::default()
    });
    let found = search(&[orphan], "sé", 10);
    assert_eq!(found.total, 1);
  }
}
