use serde::{Deserialize, Serialize};

/// Tournament header without division payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TournamentMeta {
    pub id: i64,
    pub user_id: i64,
    pub name: String,
}

/// Full tournament snapshot as served by the REST backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tournament {
    pub id: i64,
    pub user_id: i64,
    pub name: String,
    pub divisions: Vec<Division>,
}

impl Tournament {
    pub fn meta(&self) -> TournamentMeta {
        TournamentMeta {
            id: self.id,
            user_id: self.user_id,
            name: self.name.clone(),
        }
    }

    pub fn division_by_id(&self, division_id: i64) -> Option<&Division> {
        self.divisions.iter().find(|d| d.id == division_id)
    }

    /// Division lookup by display name, case-insensitive (URL routes carry
    /// names in arbitrary casing).
    pub fn division_by_name(&self, name: &str) -> Option<&Division> {
        self.divisions
            .iter()
            .find(|d| d.name.eq_ignore_ascii_case(name))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Division {
    pub id: i64,
    pub name: String,
    pub players: Vec<Player>,
    pub games: Vec<Game>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Player {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub seed: Option<i32>,
    pub wins: i32,
    pub losses: i32,
    pub spread: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Game {
    pub id: i64,
    pub division_id: i64,
    pub round: i32,
    pub player1_id: i64,
    pub player2_id: i64,
    pub player1_score: i32,
    pub player2_score: i32,
    #[serde(default)]
    pub pairing_id: Option<i64>,
}

/// Delta attached to a games-added event: new rows plus corrections.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct GameChanges {
    pub added: Vec<Game>,
    pub updated: Vec<Game>,
}

impl GameChanges {
    pub fn added_count(&self) -> usize {
        self.added.len()
    }

    pub fn updated_count(&self) -> usize {
        self.updated.len()
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty()
    }
}

/// One tournament narrowed to exactly one division.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DivisionScopedData {
    pub tournament: TournamentMeta,
    pub division: Division,
}

impl DivisionScopedData {
    /// Narrow a full snapshot to one division by id.
    pub fn scoped_to_id(tournament: &Tournament, division_id: i64) -> Option<Self> {
        tournament.division_by_id(division_id).map(|division| Self {
            tournament: tournament.meta(),
            division: division.clone(),
        })
    }

    /// Narrow a full snapshot to one division by name.
    pub fn scoped_to_name(tournament: &Tournament, division_name: &str) -> Option<Self> {
        tournament
            .division_by_name(division_name)
            .map(|division| Self {
                tournament: tournament.meta(),
                division: division.clone(),
            })
    }
}

/// Current pairing context as served by `GET /match/current`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CurrentMatch {
    pub user_id: i64,
    pub tournament_id: i64,
    pub division_id: i64,
    pub division_name: String,
    pub round: i32,
    pub pairing_id: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_tournament() -> Tournament {
        Tournament {
            id: 100,
            user_id: 1,
            name: "Spring Open".to_string(),
            divisions: vec![
                Division {
                    id: 0,
                    name: "A".to_string(),
                    players: vec![],
                    games: vec![],
                },
                Division {
                    id: 1,
                    name: "B".to_string(),
                    players: vec![],
                    games: vec![],
                },
            ],
        }
    }

    #[test]
    fn test_division_lookup_by_id() {
        let t = sample_tournament();
        assert_eq!(t.division_by_id(1).unwrap().name, "B");
        assert!(t.division_by_id(7).is_none());
    }

    #[test]
    fn test_division_lookup_by_name_is_case_insensitive() {
        let t = sample_tournament();
        assert_eq!(t.division_by_name("b").unwrap().id, 1);
        assert_eq!(t.division_by_name("B").unwrap().id, 1);
        assert!(t.division_by_name("C").is_none());
    }

    #[test]
    fn test_scoped_data_carries_only_one_division() {
        let t = sample_tournament();
        let scoped = DivisionScopedData::scoped_to_id(&t, 0).unwrap();
        assert_eq!(scoped.tournament.id, 100);
        assert_eq!(scoped.division.id, 0);

        let by_name = DivisionScopedData::scoped_to_name(&t, "a").unwrap();
        assert_eq!(by_name.division.id, 0);
    }
}
