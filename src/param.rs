/// Signals a proposal the graph cannot apply (bounds violation, height
/// ordering violation). Not an error: the chain counts it as an automatic
/// reject. Structural failures use `anyhow::Error` instead.
#[derive(Debug, Clone)]
pub struct MoveVeto {
    pub reason: String,
}

impl MoveVeto {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

impl std::fmt::Display for MoveVeto {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "move vetoed: {}", self.reason)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Bounds {
    pub lo: f64,
    pub hi: f64,
}

pub type ParamId = usize;
pub type ModelId = usize;

/// A named mutable numeric vector, the atomic unit of state that proposals
/// mutate. Keeps a shadow copy of its pre-proposal values; the shadow is
/// taken lazily on the first mutation of a transaction.
#[derive(Debug, Clone)]
pub struct Parameter {
    pub name: String,
    values: Vec<f64>,
    stored: Vec<f64>,
    bounds: Option<Bounds>,
    touched: bool,
    pub owner: ModelId,
}

impl Parameter {
    pub fn new(name: impl Into<String>, values: Vec<f64>, bounds: Option<Bounds>) -> Self {
        let stored = values.clone();
        Self {
            name: name.into(),
            values,
            stored,
            bounds,
            touched: false,
            owner: 0,
        }
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    pub fn value(&self, index: usize) -> f64 {
        self.values[index]
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    /// Bounds-checked write. On the first write of a transaction the live
    /// values are shadowed so a later `restore` can revert them.
    pub(crate) fn set(&mut self, index: usize, value: f64) -> Result<(), MoveVeto> {
        if index >= self.values.len() {
            return Err(MoveVeto::new(format!(
                "parameter {}: index {} out of range (dim {})",
                self.name,
                index,
                self.values.len()
            )));
        }
        if let Some(b) = self.bounds {
            if value < b.lo || value > b.hi {
                return Err(MoveVeto::new(format!(
                    "parameter {}: value {} outside [{}, {}]",
                    self.name, value, b.lo, b.hi
                )));
            }
        }
        if !self.touched {
            self.stored.clone_from(&self.values);
            self.touched = true;
        }
        self.values[index] = value;
        Ok(())
    }

    /// Grow or shrink the vector. Rebinding, not destruction: the shadow is
    /// resized with it so the transaction protocol stays coherent.
    pub(crate) fn set_dim(&mut self, dim: usize, fill: f64) -> Result<(), MoveVeto> {
        if let Some(b) = self.bounds {
            if dim > self.values.len() && (fill < b.lo || fill > b.hi) {
                return Err(MoveVeto::new(format!(
                    "parameter {}: fill value {} outside [{}, {}]",
                    self.name, fill, b.lo, b.hi
                )));
            }
        }
        if !self.touched {
            self.stored.clone_from(&self.values);
            self.touched = true;
        }
        self.values.resize(dim, fill);
        Ok(())
    }

    pub(crate) fn restore(&mut self) {
        if self.touched {
            self.values.clone_from(&self.stored);
            self.touched = false;
        }
    }

    pub(crate) fn accept(&mut self) {
        if self.touched {
            self.stored.clone_from(&self.values);
            self.touched = false;
        }
    }

}

/// Flat arena of parameters, indexed by `ParamId`. Mutation goes through the
/// graph so change events cannot be skipped; reads are free.
#[derive(Debug, Clone, Default)]
pub struct ParamStore {
    params: Vec<Parameter>,
}

impl ParamStore {
    pub fn add(&mut self, param: Parameter) -> ParamId {
        self.params.push(param);
        self.params.len() - 1
    }

    pub fn get(&self, id: ParamId) -> &Parameter {
        &self.params[id]
    }

    pub(crate) fn get_mut(&mut self, id: ParamId) -> &mut Parameter {
        &mut self.params[id]
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Parameter> {
        self.params.iter()
    }

    pub(crate) fn restore_all(&mut self) {
        for p in &mut self.params {
            p.restore();
        }
    }

    pub(crate) fn accept_all(&mut self) {
        for p in &mut self.params {
            p.accept();
        }
    }
}
