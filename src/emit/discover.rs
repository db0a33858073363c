//! Definition row assignment.

use super::Session;
use crate::{
    binary::{index, table::Module as ModuleRow},
    error::{Error, Result},
    model::{EventId, FieldId, MethodId, PropertyId, TypeId},
};
use std::collections::HashMap;
use tracing::debug;

impl Session<'_> {
    /// Orders defined types so every enclosing type precedes its nested
    /// types, with `<Module>` first and siblings in declaration order.
    fn type_order(&self) -> Result<Vec<TypeId>> {
        let module = self.module;

        let mut roots = vec![];
        let mut children: HashMap<TypeId, Vec<TypeId>> = HashMap::new();
        let mut defined = 0;

        for (i, node) in module.types.iter().enumerate() {
            if !node.is_defined() {
                continue;
            }
            defined += 1;

            let id = TypeId(i);
            match node.declaring_type {
                Some(outer) => {
                    module.type_node(outer)?;
                    children.entry(outer).or_default().push(id);
                }
                None => roots.push(id),
            }
        }

        let mut order = Vec::with_capacity(defined);
        let mut stack: Vec<TypeId> = roots.into_iter().rev().collect();
        while let Some(id) = stack.pop() {
            order.push(id);
            if let Some(nested) = children.get(&id) {
                stack.extend(nested.iter().rev());
            }
        }

        if order.len() != defined {
            return Err(Error::InvariantViolation(format!(
                "{} defined types are nested in external types or in a cycle",
                defined - order.len()
            )));
        }

        Ok(order)
    }

    pub(super) fn discover(&mut self) -> Result<()> {
        let module = self.module;

        match module.types.first() {
            Some(node) if node.is_defined() && node.declaring_type.is_none() => {}
            _ => {
                return Err(Error::InvariantViolation(
                    "the first type must be the defined <Module> type".to_string(),
                ))
            }
        }

        self.tables.module.push(ModuleRow {
            generation: 0,
            name: self.strings.write(&module.name),
            mvid: self.guids.write(module.mvid),
            enc_id: index::GUID(0),
            enc_base_id: index::GUID(0),
        });

        let order = self.type_order()?;

        let (mut field, mut method, mut param, mut property, mut event) = (1, 1, 1, 1, 1);
        for (i, &id) in order.iter().enumerate() {
            let node = module.type_node(id)?;
            self.tokens.type_defs.insert(id, i + 1);
            self.tokens.type_lists.insert(id, (field, method));

            for index in 0..node.fields.len() {
                self.tokens.fields.insert(FieldId::new(id, index), field);
                field += 1;
            }

            for (index, m) in node.methods.iter().enumerate() {
                if m.parameters.len() > m.signature.parameters.len() {
                    return Err(Error::InvariantViolation(format!(
                        "method {} describes {} parameters but its signature has {}",
                        m.name,
                        m.parameters.len(),
                        m.signature.parameters.len()
                    )));
                }

                let method_id = MethodId::new(id, index);
                self.tokens.methods.insert(method_id, method);
                method += 1;

                let count = usize::from(m.return_info.is_some()) + m.parameters.len();
                self.tokens.params.insert(method_id, (param, count));
                param += count;
            }

            for index in 0..node.properties.len() {
                self.tokens.properties.insert(PropertyId::new(id, index), property);
                property += 1;
            }

            for index in 0..node.events.len() {
                self.tokens.events.insert(EventId::new(id, index), event);
                event += 1;
            }
        }

        self.body_ranges = vec![None; method - 1];
        debug!(
            types = order.len(),
            fields = field - 1,
            methods = method - 1,
            params = param - 1,
            "assigned definition rows"
        );
        self.tokens.type_order = order;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        emit::{Session, WriteOptions},
        model::{members::*, module::*, signature::*, types::*, MethodId, TypeId},
        Error,
    };

    #[test]
    fn nested_types_follow_their_enclosing_type() -> Result<(), Box<dyn std::error::Error>> {
        let mut module = Module::new("order.dll");
        let outer = module.push_type(TypeNode::new(Some("Demo"), "Outer", TypeKind::Class));
        let other = module.push_type(TypeNode::new(Some("Demo"), "Other", TypeKind::Class));
        let inner = module.push_nested_type(outer, TypeNode::new(None, "Inner", TypeKind::Class));
        let deeper = module.push_nested_type(inner, TypeNode::new(None, "Deeper", TypeKind::Class));

        let options = WriteOptions::default();
        let mut session = Session::new(&module, &options);
        session.discover()?;

        assert_eq!(session.tokens.type_order, [TypeId::MODULE, outer, inner, deeper, other]);
        assert_eq!(session.tokens.type_defs[&other], 5);
        assert_eq!(session.tables.module.len(), 1);
        Ok(())
    }

    #[test]
    fn member_rows_are_contiguous() -> Result<(), Box<dyn std::error::Error>> {
        let mut module = Module::new("rows.dll");
        let first = module.push_type(TypeNode::new(None, "First", TypeKind::Class));
        let empty = module.push_type(TypeNode::new(None, "Empty", TypeKind::Class));
        let last = module.push_type(TypeNode::new(None, "Last", TypeKind::Class));

        let mut method = Method::new(
            "Add",
            MethodSignature::static_member(TypeSig::Int32, vec![TypeSig::Int32, TypeSig::Int32]),
        );
        method.parameters = vec![ParameterInfo::named("a"), ParameterInfo::named("b")];
        method.return_info = Some(ParameterInfo::default());
        module.push_method(first, method);
        module.push_method(last, Method::new("Run", MethodSignature::static_member(TypeSig::Void, vec![])));

        let options = WriteOptions::default();
        let mut session = Session::new(&module, &options);
        session.discover()?;

        assert_eq!(session.tokens.type_lists[&empty], (1, 2));
        assert_eq!(session.tokens.methods[&MethodId::new(last, 0)], 2);
        assert_eq!(session.tokens.params[&MethodId::new(first, 0)], (1, 3));
        assert_eq!(session.tokens.params[&MethodId::new(last, 0)], (4, 0));
        assert_eq!(session.body_ranges.len(), 2);
        Ok(())
    }

    #[test]
    fn nesting_cycle() {
        let mut module = Module::new("cycle.dll");
        let a = module.push_type(TypeNode::new(None, "A", TypeKind::Class));
        let b = module.push_nested_type(a, TypeNode::new(None, "B", TypeKind::Class));
        module.types[a.0].declaring_type = Some(b);

        let options = WriteOptions::default();
        let mut session = Session::new(&module, &options);
        assert!(matches!(session.discover(), Err(Error::InvariantViolation(_))));
    }
}
