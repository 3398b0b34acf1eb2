use crate::firestore::value::FirestoreValue;

#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct ArrayValue {
    values: Vec<FirestoreValue>,
}

impl ArrayValue {
    pub fn new(values: Vec<FirestoreValue>) -> Self {
        Self { values }
    }

    pub fn values(&self) -> &[FirestoreValue] {
        &self.values
    }

    pub fn contains(&self, value: &FirestoreValue) -> bool {
        self.values.iter().any(|candidate| candidate == value)
    }

    pub fn into_values(self) -> Vec<FirestoreValue> {
        self.values
    }
}
