use std::collections::{BTreeMap, HashMap};

use serde::Serialize;

use crate::kafka::error_code;
use crate::kafka::metadata::MetadataResponse;

/// One broker from cluster metadata. A broker is in service when it leads
/// at least one partition of some topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Broker {
    pub id: i32,
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionLeader {
    pub id: i32,
    pub broker_index: usize,
}

/// Per-topic routing state: partitions sorted by id, their leaders, and
/// the partition-choice vector per leading broker that the any-partition
/// chooser walks.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TopicMetadata {
    partitions: Vec<PartitionLeader>,
    by_broker: HashMap<usize, Vec<i32>>,
    broker_indexes: Vec<usize>,
}

impl TopicMetadata {
    pub fn partition_count(&self) -> usize {
        self.partitions.len()
    }

    pub fn partitions(&self) -> &[PartitionLeader] {
        &self.partitions
    }

    /// Deterministic choice for PartitionKey routing:
    /// `key mod partition_count`, indexing partitions sorted by id.
    pub fn partition_for_key(&self, key: i32) -> Option<PartitionLeader> {
        if self.partitions.is_empty() {
            return None;
        }
        let index = key.rem_euclid(self.partitions.len() as i32) as usize;
        Some(self.partitions[index])
    }

    /// Broker indexes leading at least one partition of this topic,
    /// ascending.
    pub fn broker_indexes(&self) -> &[usize] {
        &self.broker_indexes
    }

    /// Partition ids led by `broker_index`, ascending.
    pub fn partitions_on(&self, broker_index: usize) -> &[i32] {
        self.by_broker
            .get(&broker_index)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn leader_of(&self, partition: i32) -> Option<usize> {
        self.partitions
            .iter()
            .find(|p| p.id == partition)
            .map(|p| p.broker_index)
    }
}

/// An immutable snapshot of cluster topology. The refresher publishes a
/// new `Arc<Metadata>` on change; routing decisions each hold one clone.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Metadata {
    brokers: Vec<Broker>,
    topics: HashMap<String, TopicMetadata>,
}

#[derive(Debug, Serialize)]
pub struct MetadataSummary {
    pub brokers: Vec<Broker>,
    pub topics: BTreeMap<String, BTreeMap<i32, i32>>,
}

impl Metadata {
    /// Builds routing state from a metadata response. Topics and
    /// partitions the cluster reports as errored, and partitions without
    /// a live leader, are left out; the router treats them as unknown.
    pub fn from_response(response: &MetadataResponse) -> Metadata {
        let brokers: Vec<Broker> = response
            .brokers
            .iter()
            .map(|b| Broker {
                id: b.node_id,
                host: b.host.clone(),
                port: b.port as u16,
            })
            .collect();
        let index_of: HashMap<i32, usize> = brokers
            .iter()
            .enumerate()
            .map(|(i, b)| (b.id, i))
            .collect();

        let mut topics = HashMap::new();
        for topic in &response.topics {
            if topic.error_code != error_code::NONE {
                continue;
            }

            let mut partitions = Vec::new();
            let mut by_broker: HashMap<usize, Vec<i32>> = HashMap::new();
            for partition in &topic.partitions {
                if partition.error_code != error_code::NONE
                    && partition.error_code != error_code::REPLICA_NOT_AVAILABLE
                {
                    continue;
                }
                let Some(&broker_index) = index_of.get(&partition.leader) else {
                    continue;
                };
                partitions.push(PartitionLeader {
                    id: partition.id,
                    broker_index,
                });
                by_broker.entry(broker_index).or_default().push(partition.id);
            }

            if partitions.is_empty() {
                continue;
            }
            partitions.sort_by_key(|p| p.id);
            for ids in by_broker.values_mut() {
                ids.sort_unstable();
            }
            let mut broker_indexes: Vec<usize> = by_broker.keys().copied().collect();
            broker_indexes.sort_unstable();

            topics.insert(
                topic.name.clone(),
                TopicMetadata {
                    partitions,
                    by_broker,
                    broker_indexes,
                },
            );
        }

        Metadata { brokers, topics }
    }

    pub fn brokers(&self) -> &[Broker] {
        &self.brokers
    }

    pub fn broker(&self, index: usize) -> Option<&Broker> {
        self.brokers.get(index)
    }

    pub fn topic(&self, name: &str) -> Option<&TopicMetadata> {
        self.topics.get(name)
    }

    pub fn topic_count(&self) -> usize {
        self.topics.len()
    }

    /// Broker indexes leading at least one partition anywhere, ascending.
    pub fn in_service_brokers(&self) -> Vec<usize> {
        let mut indexes: Vec<usize> = self
            .topics
            .values()
            .flat_map(|t| t.broker_indexes.iter().copied())
            .collect();
        indexes.sort_unstable();
        indexes.dedup();
        indexes
    }

    pub fn summary(&self) -> MetadataSummary {
        MetadataSummary {
            brokers: self.brokers.clone(),
            topics: self
                .topics
                .iter()
                .map(|(name, topic)| {
                    (
                        name.clone(),
                        topic
                            .partitions
                            .iter()
                            .map(|p| (p.id, self.brokers[p.broker_index].id))
                            .collect(),
                    )
                })
                .collect(),
        }
    }
}

/// Round-robin partition cursor for one (broker, topic) pair. A choice is
/// cached until it is consumed; the counter only advances once a message
/// actually went out with the cached choice, so a failed enqueue retries
/// the same partition.
#[derive(Debug, Default)]
pub struct AnyPartitionChooser {
    count: u64,
    choice: Option<i32>,
    choice_used: bool,
}

impl AnyPartitionChooser {
    /// Picks (or returns the cached) partition from `partitions`, which
    /// must be the broker's nonempty choice vector for the topic.
    pub fn choice(&mut self, partitions: &[i32]) -> i32 {
        assert!(!partitions.is_empty());
        *self
            .choice
            .get_or_insert_with(|| partitions[(self.count % partitions.len() as u64) as usize])
    }

    pub fn set_choice_used(&mut self) {
        self.choice_used = true;
    }

    pub fn clear_choice(&mut self) {
        self.choice = None;
        if self.choice_used {
            self.count += 1;
            self.choice_used = false;
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use crate::kafka::metadata::{BrokerMeta, MetadataResponse, PartitionMeta, TopicMeta};

    /// Builds a response from `(topic, [(partition, leader)])` pairs.
    pub fn response(
        brokers: &[(i32, &str, i32)],
        topics: &[(&str, &[(i32, i32)])],
    ) -> MetadataResponse {
        MetadataResponse {
            correlation_id: 0,
            brokers: brokers
                .iter()
                .map(|(node_id, host, port)| BrokerMeta {
                    node_id: *node_id,
                    host: (*host).to_owned(),
                    port: *port,
                })
                .collect(),
            topics: topics
                .iter()
                .map(|(name, partitions)| TopicMeta {
                    error_code: 0,
                    name: (*name).to_owned(),
                    partitions: partitions
                        .iter()
                        .map(|(id, leader)| PartitionMeta {
                            error_code: 0,
                            id: *id,
                            leader: *leader,
                            replicas: vec![*leader],
                            isr: vec![*leader],
                        })
                        .collect(),
                })
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::response;
    use super::*;

    #[test]
    fn builds_routing_state_from_response() {
        let md = Metadata::from_response(&response(
            &[(1, "a", 9092), (2, "b", 9092)],
            &[("t", &[(0, 1), (1, 2), (2, 1)])],
        ));

        assert_eq!(md.brokers().len(), 2);
        let topic = md.topic("t").unwrap();
        assert_eq!(topic.partition_count(), 3);
        assert_eq!(topic.broker_indexes(), &[0, 1]);
        assert_eq!(topic.partitions_on(0), &[0, 2]);
        assert_eq!(topic.partitions_on(1), &[1]);
        assert_eq!(topic.leader_of(2), Some(0));
        assert_eq!(md.in_service_brokers(), vec![0, 1]);
    }

    #[test]
    fn partition_key_selection_is_mod_count() {
        let md = Metadata::from_response(&response(
            &[(1, "a", 9092)],
            &[("t", &[(0, 1), (1, 1), (2, 1)])],
        ));
        let topic = md.topic("t").unwrap();

        assert_eq!(topic.partition_for_key(0).unwrap().id, 0);
        assert_eq!(topic.partition_for_key(4).unwrap().id, 1);
        // Negative keys still map into range.
        assert_eq!(topic.partition_for_key(-1).unwrap().id, 2);
    }

    #[test]
    fn dead_leaders_are_dropped() {
        let resp = response(&[(1, "a", 9092)], &[("t", &[(0, 1), (1, 9)])]);
        let md = Metadata::from_response(&resp);

        // Partition 1's leader is not in the broker list.
        assert_eq!(md.topic("t").unwrap().partition_count(), 1);
    }

    #[test]
    fn chooser_round_robins_once_choices_are_used() {
        let mut chooser = AnyPartitionChooser::default();
        let partitions = [0, 1, 2];

        // S1: three consumed choices walk the partitions in order.
        for expected in [0, 1, 2] {
            assert_eq!(chooser.choice(&partitions), expected);
            chooser.set_choice_used();
            chooser.clear_choice();
        }

        // An unconsumed choice does not advance the cursor.
        assert_eq!(chooser.choice(&partitions), 0);
        chooser.clear_choice();
        assert_eq!(chooser.choice(&partitions), 0);
    }
}
