use super::*;
use shared::error::Result;

#[test]
fn test_random_generator_collision() -> Result<()> {
    let generators: Vec<(&str, fn() -> String)> = vec![
        ("CandidateID", generate_cand_id),
        ("PWD", generate_pwd),
        ("Ufrag", generate_ufrag),
    ];

    const N: usize = 10;
    const ITERATION: usize = 10;

    for (name, generate) in generators {
        for _ in 0..ITERATION {
            let rs: Vec<String> = (0..N).map(|_| generate()).collect();

            for i in 0..N {
                for j in i + 1..N {
                    assert_ne!(
                        rs[i], rs[j],
                        "{}: generateRandString caused collision: {} == {}",
                        name, rs[i], rs[j],
                    );
                }
            }
        }
    }

    Ok(())
}

#[test]
fn test_credential_lengths() {
    assert_eq!(generate_ufrag().len(), 16);
    assert_eq!(generate_pwd().len(), 32);
    let id = generate_cand_id();
    assert_eq!(id.len(), "candidate:".len() + 32);
    assert!(
        id["candidate:".len()..]
            .bytes()
            .all(|b| RUNES_CANDIDATE_ID_FOUNDATION.contains(&b))
    );
}
