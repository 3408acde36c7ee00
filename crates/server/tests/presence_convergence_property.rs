use std::collections::BTreeSet;

use proptest::prelude::*;
use syncroom_server::presence::PresenceSet;
use uuid::Uuid;

const INSTANCES: usize = 3;
const USERS: usize = 4;
const ROOMS: [&str; 2] = ["alice/notes", "bob/plans"];

#[derive(Debug, Clone)]
enum Step {
    Connect { instance: usize, user: usize, room: usize },
    /// Close the live connection at this index (modulo the live count).
    Disconnect { pick: usize },
    /// An instance purges its own rows, as on restart.
    Purge { instance: usize },
}

#[derive(Debug, Clone)]
struct LiveConnection {
    instance: usize,
    user: usize,
    room: usize,
    connection_id: Uuid,
}

fn step_strategy() -> impl Strategy<Value = Step> {
    prop_oneof![
        6 => (0..INSTANCES, 0..USERS, 0..ROOMS.len())
            .prop_map(|(instance, user, room)| Step::Connect { instance, user, room }),
        4 => any::<usize>().prop_map(|pick| Step::Disconnect { pick }),
        1 => (0..INSTANCES).prop_map(|instance| Step::Purge { instance }),
    ]
}

fn expected_members(live: &[LiveConnection], room: usize, users: &[Uuid]) -> BTreeSet<Uuid> {
    live.iter().filter(|connection| connection.room == room).map(|connection| users[connection.user]).collect()
}

async fn run_steps(steps: Vec<Step>) -> Result<(), TestCaseError> {
    let first = PresenceSet::memory(Uuid::new_v4());
    let mut instances = vec![first.clone()];
    for _ in 1..INSTANCES {
        instances.push(first.for_instance(Uuid::new_v4()));
    }
    let users: Vec<Uuid> = (0..USERS).map(|_| Uuid::new_v4()).collect();
    let mut live: Vec<LiveConnection> = Vec::new();

    for step in steps {
        match step {
            Step::Connect { instance, user, room } => {
                let connection_id = Uuid::new_v4();
                instances[instance]
                    .add(ROOMS[room], users[user], connection_id)
                    .await
                    .expect("add should succeed");
                live.push(LiveConnection { instance, user, room, connection_id });
            }
            Step::Disconnect { pick } => {
                if live.is_empty() {
                    continue;
                }
                let connection = live.remove(pick % live.len());
                instances[connection.instance]
                    .remove(ROOMS[connection.room], users[connection.user], connection.connection_id)
                    .await
                    .expect("remove should succeed");
            }
            Step::Purge { instance } => {
                instances[instance].purge_instance().await.expect("purge should succeed");
                live.retain(|connection| connection.instance != instance);
            }
        }

        // Every instance must agree with the model after each step.
        for (room_index, room) in ROOMS.iter().enumerate() {
            let expected = expected_members(&live, room_index, &users);
            for instance in &instances {
                let members = instance.members(room).await.expect("members should load");
                let distinct: BTreeSet<Uuid> = members.iter().copied().collect();
                prop_assert_eq!(distinct.len(), members.len(), "members must be distinct");
                prop_assert_eq!(&distinct, &expected);
            }
        }
    }

    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn presence_converges_across_instances(steps in prop::collection::vec(step_strategy(), 1..40)) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("runtime should build");
        runtime.block_on(run_steps(steps))?;
    }
}
